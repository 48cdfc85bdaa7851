//! Periodic real-time task scheduling.
//!
//! [`RtScheduler`] is the seam to the platform's real-time facility:
//! a periodic timer and tasks that run a body once per period.
//! [`ThreadScheduler`] implements it with a dedicated OS thread per task,
//! paced with `clock_nanosleep` and `TIMER_ABSTIME` on `CLOCK_MONOTONIC`.
//!
//! A task is created idle, then armed with its first deadline and period.
//! Deleting it is cooperative: the loop notices the request at its next
//! period boundary, so the body is never interrupted mid-cycle.

use crate::realtime::apply_realtime;
use pdx_common::config::{RealtimeConfig, TaskConfig};
use pdx_common::error::{PdxError, PdxResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Body executed once per period.
pub type TaskBody = Box<dyn FnMut() + Send>;

/// Parameters of a periodic task.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// Thread name, priority and stack size.
    pub task: TaskConfig,
    /// Real-time settings applied on the task thread.
    pub realtime: RealtimeConfig,
}

/// Platform real-time facility.
pub trait RtScheduler {
    /// Task handle type.
    type Task: PeriodicTask;

    /// Start the periodic timer, returning the period the platform can
    /// actually deliver for `requested`.
    fn start_timer(&mut self, requested: Duration) -> PdxResult<Duration>;

    /// Create an idle task running `body` once armed.
    fn create_task(&mut self, spec: &TaskSpec, body: TaskBody) -> PdxResult<Self::Task>;

    /// Stop the periodic timer.
    fn stop_timer(&mut self);
}

/// A created periodic task.
pub trait PeriodicTask: Send {
    /// Start periodic execution at `first_deadline`, then every `period`.
    fn arm(&mut self, first_deadline: Instant, period: Duration) -> PdxResult<()>;

    /// Stop the task at its next period boundary and wait for it to exit.
    fn delete(self);
}

/// Round `requested` to a whole number of timer resolution steps.
#[must_use]
pub fn quantize_period(requested: Duration, resolution: Duration) -> Duration {
    let res = resolution.as_nanos();
    if res <= 1 {
        return requested;
    }
    let steps = ((requested.as_nanos() + res / 2) / res).max(1);
    Duration::from_nanos(u64::try_from(steps * res).unwrap_or(u64::MAX))
}

#[cfg(target_os = "linux")]
fn timer_resolution() -> Duration {
    use nix::time::{clock_getres, ClockId};

    match clock_getres(ClockId::CLOCK_MONOTONIC) {
        Ok(res) => Duration::new(
            u64::try_from(res.tv_sec()).unwrap_or(0),
            u32::try_from(res.tv_nsec()).unwrap_or(0),
        ),
        Err(e) => {
            warn!("clock_getres failed, assuming 1ns resolution: {e}");
            Duration::from_nanos(1)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn timer_resolution() -> Duration {
    Duration::from_nanos(1)
}

/// Scheduler backed by OS threads.
#[derive(Debug, Default)]
pub struct ThreadScheduler {
    period: Option<Duration>,
}

impl ThreadScheduler {
    /// Create a scheduler with the timer stopped.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Period of the running timer.
    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        self.period
    }
}

impl RtScheduler for ThreadScheduler {
    type Task = ThreadTask;

    fn start_timer(&mut self, requested: Duration) -> PdxResult<Duration> {
        if requested.is_zero() {
            return Err(PdxError::Scheduler("timer period must be positive".into()));
        }
        if let Some(period) = self.period {
            return Err(PdxError::Scheduler(format!(
                "timer already running with period {period:?}"
            )));
        }

        let actual = quantize_period(requested, timer_resolution());
        if actual != requested {
            warn!(?requested, ?actual, "Timer period adjusted to clock resolution");
        }
        self.period = Some(actual);
        info!(period = ?actual, "Periodic timer started");
        Ok(actual)
    }

    fn create_task(&mut self, spec: &TaskSpec, body: TaskBody) -> PdxResult<ThreadTask> {
        if self.period.is_none() {
            return Err(PdxError::Scheduler(
                "cannot create a task before the timer is started".into(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (control_tx, control_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread_spec = spec.clone();
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(spec.task.name.clone())
            .stack_size(spec.task.stack_size)
            .spawn(move || task_main(&thread_spec, body, &control_rx, &thread_stop, &ready_tx))
            .map_err(|e| PdxError::Scheduler(format!("failed to spawn task thread: {e}")))?;

        let task = ThreadTask {
            name: spec.task.name.clone(),
            handle: Some(handle),
            control: control_tx,
            stop,
            armed: false,
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {
                debug!(name = %task.name, "Periodic task created");
                Ok(task)
            }
            Ok(Err(e)) => {
                task.delete();
                Err(e)
            }
            Err(_) => {
                task.delete();
                Err(PdxError::Scheduler("task thread exited during setup".into()))
            }
        }
    }

    fn stop_timer(&mut self) {
        if self.period.take().is_some() {
            info!("Periodic timer stopped");
        }
    }
}

#[derive(Debug)]
enum Control {
    Arm {
        first_deadline: Instant,
        period: Duration,
    },
    Stop,
}

fn task_main(
    spec: &TaskSpec,
    mut body: TaskBody,
    control: &Receiver<Control>,
    stop: &AtomicBool,
    ready: &Sender<PdxResult<()>>,
) {
    let setup = apply_realtime(&spec.realtime, spec.task.priority).map(|_| ());
    let failed = setup.is_err();
    let _ = ready.send(setup);
    if failed {
        return;
    }

    let (first_deadline, period) = match control.recv() {
        Ok(Control::Arm {
            first_deadline,
            period,
        }) => (first_deadline, period),
        Ok(Control::Stop) | Err(_) => {
            debug!("Periodic task deleted before it was armed");
            return;
        }
    };

    let mut pacer = Pacer::new(first_deadline, period);
    let mut cycles: u64 = 0;
    loop {
        pacer.wait();
        if stop.load(Ordering::Acquire) {
            break;
        }
        body();
        cycles += 1;
    }
    debug!(cycles, "Periodic task loop exited");
}

/// Handle of a [`ThreadScheduler`] task.
#[derive(Debug)]
pub struct ThreadTask {
    name: String,
    handle: Option<JoinHandle<()>>,
    control: Sender<Control>,
    stop: Arc<AtomicBool>,
    armed: bool,
}

impl ThreadTask {
    /// Thread name of the task.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the task was armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl PeriodicTask for ThreadTask {
    fn arm(&mut self, first_deadline: Instant, period: Duration) -> PdxResult<()> {
        if self.armed {
            return Err(PdxError::Scheduler(format!("task {} already armed", self.name)));
        }
        if period.is_zero() {
            return Err(PdxError::Scheduler("task period must be positive".into()));
        }
        self.control
            .send(Control::Arm {
                first_deadline,
                period,
            })
            .map_err(|_| PdxError::Scheduler(format!("task {} is gone", self.name)))?;
        self.armed = true;
        info!(name = %self.name, ?period, "Periodic task armed");
        Ok(())
    }

    fn delete(mut self) {
        self.stop.store(true, Ordering::Release);
        // wakes a task still waiting to be armed; ignored once it runs
        let _ = self.control.send(Control::Stop);

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!(name = %self.name, "Periodic task panicked");
            }
        }
        debug!(name = %self.name, "Periodic task deleted");
    }
}

/// Absolute-deadline pacing for the task loop.
#[cfg(target_os = "linux")]
struct Pacer {
    next: nix::sys::time::TimeSpec,
    period: nix::sys::time::TimeSpec,
}

#[cfg(target_os = "linux")]
impl Pacer {
    fn new(first_deadline: Instant, period: Duration) -> Self {
        use nix::sys::time::TimeSpec;
        use nix::time::ClockId;

        let offset = first_deadline.saturating_duration_since(Instant::now());
        let now = ClockId::CLOCK_MONOTONIC.now().unwrap_or_else(|e| {
            warn!("CLOCK_MONOTONIC unavailable: {e}");
            TimeSpec::new(0, 0)
        });
        Self {
            next: now + TimeSpec::from_duration(offset),
            period: TimeSpec::from_duration(period),
        }
    }

    /// Sleep until the current deadline, then advance it by one period.
    fn wait(&mut self) {
        use nix::errno::Errno;
        use nix::time::{clock_nanosleep, ClockId, ClockNanosleepFlags};

        loop {
            match clock_nanosleep(
                ClockId::CLOCK_MONOTONIC,
                ClockNanosleepFlags::TIMER_ABSTIME,
                &self.next,
            ) {
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("clock_nanosleep failed: {e}");
                    break;
                }
                Ok(_) => break,
            }
        }
        self.next = self.next + self.period;
    }
}

#[cfg(not(target_os = "linux"))]
struct Pacer {
    next: Instant,
    period: Duration,
}

#[cfg(not(target_os = "linux"))]
impl Pacer {
    fn new(first_deadline: Instant, period: Duration) -> Self {
        Self {
            next: first_deadline,
            period,
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
        }
        self.next += self.period;
    }
}
