//! Startup and teardown of the exchange.
//!
//! Startup walks a fixed list of [`SetupStep`]s. The first failure aborts
//! the sequence and undoes every completed step in reverse order; no step
//! is retried. Teardown of a running exchange releases the same resources
//! in the same reverse order.

use crate::bus::{BusAccess, BusHandle};
use crate::cyclic::{CycleLogic, CyclicTask};
use crate::gate::{CriticalWindow, DeadlineGate};
use crate::lock::{Holder, LockGuard, LockState, SharedLock};
use crate::scheduler::{PeriodicTask, RtScheduler, TaskSpec};
use crate::status::{StatusSink, StatusTracker};
use pdx_common::config::ExchangeConfig;
use pdx_common::error::{PdxError, PdxResult};
use pdx_common::metrics::{ExchangeStats, StatsSnapshot};
use pdx_common::state::{StateMachine, TaskState};
use pdx_common::time::{Clock, MonotonicClock};
use pdx_fieldbus::{
    registrations_from_config, BindingTable, BusMaster, BusProvider, DomainId, LockCallbacks,
    PdoRegistration,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Startup steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStep {
    /// Create the shared lock.
    InitLock,
    /// Reserve the bus master.
    RequestMaster,
    /// Hand the gate to the master as its lock callbacks.
    RegisterCallbacks,
    /// Create the process-data domain.
    CreateDomain,
    /// Register the process variable mapping.
    RegisterBindings,
    /// Activate the master.
    Activate,
    /// Start the periodic timer.
    StartTimer,
    /// Create the periodic task.
    CreateTask,
    /// Arm the task with its first deadline.
    ArmTask,
}

impl SetupStep {
    /// All steps in execution order.
    pub const ALL: [SetupStep; 9] = [
        Self::InitLock,
        Self::RequestMaster,
        Self::RegisterCallbacks,
        Self::CreateDomain,
        Self::RegisterBindings,
        Self::Activate,
        Self::StartTimer,
        Self::CreateTask,
        Self::ArmTask,
    ];
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitLock => "init-lock",
            Self::RequestMaster => "request-master",
            Self::RegisterCallbacks => "register-callbacks",
            Self::CreateDomain => "create-domain",
            Self::RegisterBindings => "register-bindings",
            Self::Activate => "activate",
            Self::StartTimer => "start-timer",
            Self::CreateTask => "create-task",
            Self::ArmTask => "arm-task",
        };
        f.write_str(name)
    }
}

/// Master before and after it is shared with the task.
enum MasterSlot<M> {
    Owned(M),
    Shared(Arc<BusHandle<M>>),
}

impl<M: BusMaster> MasterSlot<M> {
    fn get(&self) -> &M {
        match self {
            Self::Owned(master) => master,
            Self::Shared(handle) => handle.master(),
        }
    }
}

/// Resources acquired so far, released in reverse on failure.
struct Acquired<M, T> {
    completed: Vec<SetupStep>,
    gate: Option<Arc<DeadlineGate>>,
    master: Option<MasterSlot<M>>,
    domain: Option<DomainId>,
    timer: bool,
    task: Option<T>,
}

impl<M: BusMaster, T: PeriodicTask> Acquired<M, T> {
    fn new() -> Self {
        Self {
            completed: Vec::with_capacity(SetupStep::ALL.len()),
            gate: None,
            master: None,
            domain: None,
            timer: false,
            task: None,
        }
    }

    /// Undo completed steps, newest first.
    ///
    /// Bus resources are released under the shared lock with the gate
    /// closed, so an asynchronous holder finishes before the master goes.
    fn roll_back<S: RtScheduler<Task = T>>(mut self, scheduler: &mut S) {
        let gate = self.gate.take();
        let mut bus_guard = None;

        while let Some(step) = self.completed.pop() {
            info!(step = %step, "Rolling back");
            match step {
                SetupStep::ArmTask | SetupStep::RegisterBindings | SetupStep::Activate => {}
                SetupStep::CreateTask => {
                    if let Some(task) = self.task.take() {
                        task.delete();
                    }
                }
                SetupStep::StartTimer => {
                    if self.timer {
                        scheduler.stop_timer();
                        self.timer = false;
                    }
                }
                SetupStep::CreateDomain => {
                    hold_bus(gate.as_ref(), &mut bus_guard);
                    if let (Some(master), Some(domain)) = (&self.master, self.domain.take()) {
                        master.get().release_domain(domain);
                    }
                }
                SetupStep::RegisterCallbacks => hold_bus(gate.as_ref(), &mut bus_guard),
                SetupStep::RequestMaster => {
                    hold_bus(gate.as_ref(), &mut bus_guard);
                    if let Some(master) = self.master.take() {
                        master.get().release();
                    }
                }
                SetupStep::InitLock => {
                    drop(bus_guard.take());
                    if let Some(gate) = &gate {
                        let state = gate.shared_lock().state();
                        if state != LockState::Free {
                            error!(%state, "Shared lock still held during rollback");
                        }
                    }
                }
            }
        }
    }
}

/// Take the shared lock for the rest of the rollback and close the gate.
fn hold_bus<'g>(gate: Option<&'g Arc<DeadlineGate>>, guard: &mut Option<LockGuard<'g>>) {
    if guard.is_some() {
        return;
    }
    if let Some(gate) = gate {
        *guard = Some(gate.shared_lock().lock(Holder::Cycle));
        gate.close();
    }
}

fn complete(completed: &mut Vec<SetupStep>, step: SetupStep) {
    info!(step = %step, "Setup step complete");
    completed.push(step);
}

/// Builds and starts an [`Exchange`].
pub struct ExchangeBuilder {
    config: ExchangeConfig,
    clock: Arc<dyn Clock>,
    status_sink: Option<StatusSink>,
}

impl fmt::Debug for ExchangeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeBuilder")
            .field("config", &self.config)
            .field("status_sink", &self.status_sink.is_some())
            .finish_non_exhaustive()
    }
}

impl ExchangeBuilder {
    /// Builder for `config`, using the monotonic clock.
    #[must_use]
    pub fn new(config: ExchangeConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::new()),
            status_sink: None,
        }
    }

    /// Use `clock` for cycle timestamps and gate decisions.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Forward status changes to `sink` in addition to logging them.
    #[must_use]
    pub fn status_sink(mut self, sink: StatusSink) -> Self {
        self.status_sink = Some(sink);
        self
    }

    /// Run the startup sequence.
    ///
    /// `logic` builds the application logic once the binding table is known.
    ///
    /// # Errors
    ///
    /// Returns [`PdxError::Config`] for an invalid configuration (nothing
    /// is acquired then), or [`PdxError::Setup`] naming the failed step
    /// after all completed steps were rolled back.
    pub fn start<P, S, L, F>(
        self,
        provider: &mut P,
        mut scheduler: S,
        logic: F,
    ) -> PdxResult<Exchange<P::Master, S>>
    where
        P: BusProvider,
        S: RtScheduler,
        L: CycleLogic,
        F: FnOnce(&BindingTable) -> PdxResult<L>,
    {
        self.config.validate()?;
        let window = CriticalWindow::from_config(&self.config)?;
        let registrations = registrations_from_config(&self.config.bindings)?;

        info!(
            master = self.config.master_index,
            frequency_hz = self.config.frequency_hz,
            inhibit = %humantime::format_duration(self.config.inhibit_time),
            "Starting process-data exchange"
        );

        let stats = Arc::new(ExchangeStats::new());
        let mut acquired = Acquired::new();

        let result = Self::run_steps(
            &self.config,
            self.clock,
            self.status_sink,
            window,
            &registrations,
            Arc::clone(&stats),
            provider,
            &mut scheduler,
            logic,
            &mut acquired,
        );

        match result {
            Ok((bus, period)) => {
                let task = acquired.task.take();
                let mut state = StateMachine::new();
                state.transition(TaskState::Running)?;
                info!(?period, "Process-data exchange running");
                Ok(Exchange {
                    bus,
                    scheduler,
                    task,
                    state,
                    stats,
                    period,
                })
            }
            Err((step, e)) => {
                error!(step = %step, "Setup failed: {e}");
                acquired.roll_back(&mut scheduler);
                Err(PdxError::setup(step, e))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_steps<P, S, L, F>(
        config: &ExchangeConfig,
        clock: Arc<dyn Clock>,
        status_sink: Option<StatusSink>,
        window: CriticalWindow,
        registrations: &[PdoRegistration],
        stats: Arc<ExchangeStats>,
        provider: &mut P,
        scheduler: &mut S,
        logic: F,
        acquired: &mut Acquired<P::Master, S::Task>,
    ) -> Result<(Arc<BusHandle<P::Master>>, Duration), (SetupStep, PdxError)>
    where
        P: BusProvider,
        S: RtScheduler,
        L: CycleLogic,
        F: FnOnce(&BindingTable) -> PdxResult<L>,
    {
        use SetupStep as Step;

        let gate = Arc::new(DeadlineGate::new(
            Arc::new(SharedLock::new()),
            clock,
            window,
            Arc::clone(&stats),
        ));
        acquired.gate = Some(Arc::clone(&gate));
        complete(&mut acquired.completed, Step::InitLock);

        let mut master = provider
            .request_master(config.master_index)
            .map_err(|e| (Step::RequestMaster, e))?;

        let callbacks: Arc<dyn LockCallbacks> = gate.clone();
        master.register_lock_callbacks(callbacks);
        acquired.master = Some(MasterSlot::Owned(master));
        complete(&mut acquired.completed, Step::RequestMaster);
        complete(&mut acquired.completed, Step::RegisterCallbacks);

        let Some(MasterSlot::Owned(master)) = acquired.master.as_mut() else {
            return Err((
                Step::CreateDomain,
                PdxError::Config("master slot not owned".into()),
            ));
        };

        let domain = master.create_domain().map_err(|e| (Step::CreateDomain, e))?;
        acquired.domain = Some(domain);
        complete(&mut acquired.completed, Step::CreateDomain);

        let slots = master
            .register_bindings(domain, registrations)
            .map_err(|e| (Step::RegisterBindings, e))?;
        let bindings = BindingTable::new(slots);
        complete(&mut acquired.completed, Step::RegisterBindings);

        master.activate().map_err(|e| (Step::Activate, e))?;
        complete(&mut acquired.completed, Step::Activate);

        let Some(MasterSlot::Owned(master)) = acquired.master.take() else {
            return Err((
                Step::StartTimer,
                PdxError::Config("master slot not owned".into()),
            ));
        };
        let bus = Arc::new(BusHandle::new(gate, master, domain, bindings));
        acquired.master = Some(MasterSlot::Shared(Arc::clone(&bus)));

        let requested = config.cycle_period();
        let period = scheduler
            .start_timer(requested)
            .map_err(|e| (Step::StartTimer, e))?;
        acquired.timer = true;
        if period != requested {
            let retimed = match window.with_period(period) {
                Ok(retimed) => retimed,
                Err(e) => {
                    scheduler.stop_timer();
                    acquired.timer = false;
                    return Err((Step::StartTimer, e));
                }
            };
            bus.gate().retime(retimed);
            info!(
                ?requested,
                actual = ?period,
                window = ?retimed.window(),
                "Admission window follows timer period"
            );
        }
        complete(&mut acquired.completed, Step::StartTimer);

        let body = {
            let logic = logic(bus.bindings()).map_err(|e| (Step::CreateTask, e))?;
            let tracker = match status_sink {
                Some(sink) => StatusTracker::with_sink(sink),
                None => StatusTracker::new(),
            };
            let mut task = CyclicTask::new(
                Arc::clone(&bus),
                logic,
                tracker,
                config.status_interval(),
                period,
                Arc::clone(&stats),
            )
            .map_err(|e| (Step::CreateTask, e))?;
            Box::new(move || {
                task.run_cycle();
            })
        };
        let spec = TaskSpec {
            task: config.task.clone(),
            realtime: config.realtime.clone(),
        };
        let task = scheduler
            .create_task(&spec, body)
            .map_err(|e| (Step::CreateTask, e))?;
        acquired.task = Some(task);
        complete(&mut acquired.completed, Step::CreateTask);

        if let Some(task) = acquired.task.as_mut() {
            task.arm(Instant::now() + period, period)
                .map_err(|e| (Step::ArmTask, e))?;
        }
        complete(&mut acquired.completed, Step::ArmTask);

        Ok((bus, period))
    }
}

/// A running process-data exchange.
///
/// Dropping it tears the exchange down; [`shutdown`](Self::shutdown) does
/// the same explicitly.
pub struct Exchange<M: BusMaster, S: RtScheduler> {
    bus: Arc<BusHandle<M>>,
    scheduler: S,
    task: Option<S::Task>,
    state: StateMachine,
    stats: Arc<ExchangeStats>,
    period: Duration,
}

impl<M: BusMaster, S: RtScheduler> fmt::Debug for Exchange<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("bus", &self.bus)
            .field("state", &self.state.state())
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

impl<M: BusMaster, S: RtScheduler> Exchange<M, S> {
    /// Lifecycle state of the periodic task.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state.state()
    }

    /// Period granted by the timer.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Handle for asynchronous bus access.
    #[must_use]
    pub fn access(&self) -> BusAccess<M> {
        BusAccess::new(Arc::clone(&self.bus))
    }

    /// The deadline gate, also registered with the master as its lock callbacks.
    #[must_use]
    pub fn gate(&self) -> Arc<DeadlineGate> {
        Arc::clone(self.bus.gate())
    }

    /// Resolved process variable slots.
    #[must_use]
    pub fn bindings(&self) -> &BindingTable {
        self.bus.bindings()
    }

    /// Current exchange statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the task and release the bus.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange was already stopped.
    pub fn shutdown(mut self) -> PdxResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> PdxResult<()> {
        self.state.transition(TaskState::Stopped)?;
        info!("Stopping process-data exchange");

        if let Some(task) = self.task.take() {
            task.delete();
        }
        self.scheduler.stop_timer();

        // wait out any asynchronous holder, then keep everyone off the bus
        let lock = self.bus.shared_lock();
        {
            let _guard = lock.lock(Holder::Cycle);
            self.bus.gate().close();
            self.bus.master().release_domain(self.bus.domain());
            self.bus.master().release();
        }

        let state = lock.state();
        if state != LockState::Free {
            warn!(%state, "Shared lock held after teardown");
        }

        let stats = self.stats.snapshot();
        info!(
            cycles = stats.cycles,
            receive_failures = stats.receive_failures,
            send_failures = stats.send_failures,
            overruns = stats.overruns,
            denied = stats.denied,
            "Process-data exchange stopped"
        );
        Ok(())
    }
}

impl<M: BusMaster, S: RtScheduler> Drop for Exchange<M, S> {
    fn drop(&mut self) {
        if !self.state.state().is_terminal() {
            if let Err(e) = self.teardown() {
                error!("Teardown on drop failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cyclic::BlinkLogic;
    use crate::scheduler::TaskBody;
    use pdx_common::config::BindingConfig;
    use pdx_common::time::ManualClock;
    use pdx_fieldbus::{Admission, BusOp, FailurePoint, ProcessImage, SimulatedProvider};
    use std::sync::Mutex;
    use std::thread;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum SchedOp {
        StartTimer,
        CreateTask,
        Arm,
        Delete,
        StopTimer,
    }

    /// Scheduler that never runs the body on its own; tests drive it.
    #[derive(Default)]
    struct ManualScheduler {
        ops: Arc<Mutex<Vec<SchedOp>>>,
        body: Arc<Mutex<Option<TaskBody>>>,
        fail_create: bool,
        fail_arm: bool,
        actual_period: Option<Duration>,
    }

    struct ManualTask {
        ops: Arc<Mutex<Vec<SchedOp>>>,
        fail_arm: bool,
    }

    impl RtScheduler for ManualScheduler {
        type Task = ManualTask;

        fn start_timer(&mut self, requested: Duration) -> PdxResult<Duration> {
            self.ops.lock().unwrap().push(SchedOp::StartTimer);
            Ok(self.actual_period.unwrap_or(requested))
        }

        fn create_task(&mut self, _spec: &TaskSpec, body: TaskBody) -> PdxResult<ManualTask> {
            if self.fail_create {
                return Err(PdxError::Scheduler("no task slots".into()));
            }
            self.ops.lock().unwrap().push(SchedOp::CreateTask);
            *self.body.lock().unwrap() = Some(body);
            Ok(ManualTask {
                ops: Arc::clone(&self.ops),
                fail_arm: self.fail_arm,
            })
        }

        fn stop_timer(&mut self) {
            self.ops.lock().unwrap().push(SchedOp::StopTimer);
        }
    }

    impl PeriodicTask for ManualTask {
        fn arm(&mut self, _first_deadline: Instant, _period: Duration) -> PdxResult<()> {
            if self.fail_arm {
                return Err(PdxError::Scheduler("timer not running".into()));
            }
            self.ops.lock().unwrap().push(SchedOp::Arm);
            Ok(())
        }

        fn delete(self) {
            self.ops.lock().unwrap().push(SchedOp::Delete);
        }
    }

    struct Idle;

    impl CycleLogic for Idle {
        fn execute(&mut self, _image: &mut ProcessImage) {}
    }

    fn config() -> ExchangeConfig {
        let binding = |name: &str, slave: &str| BindingConfig {
            name: name.into(),
            slave: slave.into(),
            vendor_id: 2,
            product_code: 0x0c1e_3052,
            index: 0x7000,
            subindex: 1,
            bit_len: 8,
        };
        ExchangeConfig {
            status_interval_cycles: Some(2),
            bindings: vec![binding("ana_in", "2"), binding("dig_out", "3")],
            ..Default::default()
        }
    }

    fn builder() -> ExchangeBuilder {
        ExchangeBuilder::new(config()).clock(Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_step_names() {
        let names: Vec<String> = SetupStep::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(names[0], "init-lock");
        assert_eq!(names[4], "register-bindings");
        assert_eq!(names[8], "arm-task");
    }

    #[test]
    fn test_start_and_shutdown_order() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        let scheduler = ManualScheduler::default();
        let ops = Arc::clone(&scheduler.ops);
        let body = Arc::clone(&scheduler.body);

        let exchange = builder()
            .start(&mut provider, scheduler, |table| {
                BlinkLogic::new(table, "dig_out")
            })
            .unwrap();
        assert_eq!(exchange.state(), TaskState::Running);
        assert_eq!(exchange.bindings().len(), 2);
        assert_eq!(exchange.period(), Duration::from_micros(500));

        for _ in 0..4 {
            (body.lock().unwrap().as_mut().unwrap())();
        }
        assert_eq!(exchange.stats().cycles, 4);

        exchange.shutdown().unwrap();

        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                SchedOp::StartTimer,
                SchedOp::CreateTask,
                SchedOp::Arm,
                SchedOp::Delete,
                SchedOp::StopTimer
            ]
        );
        let journal = bus.journal();
        assert_eq!(journal[0], BusOp::RequestMaster(0));
        assert_eq!(journal[1], BusOp::RegisterCallbacks);
        let tail = &journal[journal.len() - 2..];
        assert_eq!(tail, [BusOp::ReleaseDomain(DomainId(0)), BusOp::Release]);
    }

    #[test]
    fn test_gate_follows_timer_period() {
        let mut provider = SimulatedProvider::new();
        let scheduler = ManualScheduler {
            actual_period: Some(Duration::from_micros(496)),
            ..Default::default()
        };

        let exchange = builder()
            .start(&mut provider, scheduler, |_| Ok(Idle))
            .unwrap();
        assert_eq!(exchange.period(), Duration::from_micros(496));
        let window = exchange.gate().critical_window();
        assert_eq!(window.period(), Duration::from_micros(496));
        assert_eq!(window.inhibit(), Duration::from_micros(20));
        exchange.shutdown().unwrap();
    }

    #[test]
    fn test_timer_period_shorter_than_inhibit_time_fails() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        let scheduler = ManualScheduler {
            actual_period: Some(Duration::from_micros(10)),
            ..Default::default()
        };
        let ops = Arc::clone(&scheduler.ops);

        let err = builder()
            .start(&mut provider, scheduler, |_| Ok(Idle))
            .unwrap_err();
        assert!(matches!(err, PdxError::Setup { ref step, .. } if step == "start-timer"));
        assert_eq!(
            *ops.lock().unwrap(),
            vec![SchedOp::StartTimer, SchedOp::StopTimer]
        );
        assert_eq!(bus.journal().last(), Some(&BusOp::Release));
    }

    #[test]
    fn test_binding_failure_rolls_back_in_reverse() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        bus.fail_at(FailurePoint::RegisterBindings);
        let scheduler = ManualScheduler::default();
        let ops = Arc::clone(&scheduler.ops);

        let err = builder()
            .start(&mut provider, scheduler, |_| Ok(Idle))
            .unwrap_err();
        assert!(matches!(
            err,
            PdxError::Setup { ref step, .. } if step == "register-bindings"
        ));

        assert_eq!(
            bus.journal(),
            vec![
                BusOp::RequestMaster(0),
                BusOp::RegisterCallbacks,
                BusOp::CreateDomain(DomainId(0)),
                BusOp::ReleaseDomain(DomainId(0)),
                BusOp::Release,
            ]
        );
        assert!(ops.lock().unwrap().is_empty());
        // callbacks were dropped with the master
        assert_eq!(bus.driver_request(), Admission::Closed);
    }

    #[test]
    fn test_rollback_waits_for_asynchronous_holder() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        let mut driver = None;

        let err = builder()
            .start(&mut provider, ManualScheduler::default(), |_| {
                let worker = Arc::clone(&bus);
                driver = Some(thread::spawn(move || {
                    worker.driver_work(Duration::from_millis(100))
                }));
                while !bus.journal().contains(&BusOp::DriverRequest) {
                    thread::sleep(Duration::from_millis(1));
                }
                Err::<Idle, _>(PdxError::Config("logic unavailable".into()))
            })
            .unwrap_err();
        assert!(matches!(err, PdxError::Setup { ref step, .. } if step == "create-task"));

        let admission = driver.take().unwrap().join().unwrap();
        assert_eq!(admission, Admission::Granted);
        // the domain and master were released only after the driver left
        assert_eq!(bus.exclusion_violations(), 0);
        let journal = bus.journal();
        assert_eq!(
            &journal[journal.len() - 2..],
            [BusOp::ReleaseDomain(DomainId(0)), BusOp::Release]
        );
        assert_eq!(bus.driver_request(), Admission::Closed);
    }

    #[test]
    fn test_task_creation_failure_stops_timer() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        let scheduler = ManualScheduler {
            fail_create: true,
            ..Default::default()
        };
        let ops = Arc::clone(&scheduler.ops);

        let err = builder()
            .start(&mut provider, scheduler, |_| Ok(Idle))
            .unwrap_err();
        assert!(matches!(err, PdxError::Setup { ref step, .. } if step == "create-task"));
        assert_eq!(
            *ops.lock().unwrap(),
            vec![SchedOp::StartTimer, SchedOp::StopTimer]
        );
        let journal = bus.journal();
        assert_eq!(
            &journal[journal.len() - 2..],
            [BusOp::ReleaseDomain(DomainId(0)), BusOp::Release]
        );
    }

    #[test]
    fn test_arm_failure_deletes_task() {
        let mut provider = SimulatedProvider::new();
        let scheduler = ManualScheduler {
            fail_arm: true,
            ..Default::default()
        };
        let ops = Arc::clone(&scheduler.ops);

        let err = builder()
            .start(&mut provider, scheduler, |_| Ok(Idle))
            .unwrap_err();
        assert!(matches!(err, PdxError::Setup { ref step, .. } if step == "arm-task"));
        assert_eq!(
            *ops.lock().unwrap(),
            vec![
                SchedOp::StartTimer,
                SchedOp::CreateTask,
                SchedOp::Delete,
                SchedOp::StopTimer
            ]
        );
    }

    #[test]
    fn test_request_master_failure_acquires_nothing() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        bus.fail_at(FailurePoint::RequestMaster);

        let err = builder()
            .start(&mut provider, ManualScheduler::default(), |_| Ok(Idle))
            .unwrap_err();
        assert!(matches!(err, PdxError::Setup { ref step, .. } if step == "request-master"));
        assert!(bus.journal().is_empty());
    }

    #[test]
    fn test_missing_logic_output_fails_task_creation() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();

        let err = builder()
            .start(&mut provider, ManualScheduler::default(), |table| {
                BlinkLogic::new(table, "no_such_output")
            })
            .unwrap_err();
        assert!(matches!(err, PdxError::Setup { ref step, .. } if step == "create-task"));
        assert_eq!(bus.journal().last(), Some(&BusOp::Release));
    }

    #[test]
    fn test_invalid_config_acquires_nothing() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        let mut config = config();
        config.inhibit_time = Duration::from_millis(1);

        let err = ExchangeBuilder::new(config)
            .start(&mut provider, ManualScheduler::default(), |_| Ok(Idle))
            .unwrap_err();
        assert!(matches!(err, PdxError::Config(_)));
        assert!(bus.journal().is_empty());
    }

    #[test]
    fn test_drop_tears_down() {
        let mut provider = SimulatedProvider::new();
        let bus = provider.bus();
        let exchange = builder()
            .start(&mut provider, ManualScheduler::default(), |_| Ok(Idle))
            .unwrap();
        let access = exchange.access();
        drop(exchange);

        assert_eq!(bus.journal().last(), Some(&BusOp::Release));
        assert_eq!(access.try_with(|_| ()), Err(crate::bus::Refusal::Closed));
    }
}
