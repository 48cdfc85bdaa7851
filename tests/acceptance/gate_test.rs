//! Deadline gate behavior as seen by a bus driver's callbacks.
//!
//! Uses a manual clock so every decision is deterministic.

use super::common::init_tracing;
use pdx_common::metrics::ExchangeStats;
use pdx_common::time::{Clock, ManualClock};
use pdx_fieldbus::{Admission, BusMaster, BusOp, BusProvider, LockCallbacks, SimulatedProvider};
use pdx_runtime::{CriticalWindow, DeadlineGate, Holder, LockState, SharedLock};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const PERIOD: Duration = Duration::from_micros(500);
const INHIBIT: Duration = Duration::from_micros(20);

struct Rig {
    gate: Arc<DeadlineGate>,
    clock: Arc<ManualClock>,
    stats: Arc<ExchangeStats>,
    provider: SimulatedProvider,
}

fn rig() -> anyhow::Result<Rig> {
    init_tracing();
    let clock = Arc::new(ManualClock::new(5_000_000));
    let stats = Arc::new(ExchangeStats::new());
    let gate = Arc::new(DeadlineGate::new(
        Arc::new(SharedLock::new()),
        clock.clone(),
        CriticalWindow::new(PERIOD, INHIBIT)?,
        Arc::clone(&stats),
    ));

    let mut provider = SimulatedProvider::new();
    let mut master = provider.request_master(0)?;
    let callbacks: Arc<dyn LockCallbacks> = gate.clone();
    // dropping the handle without release() keeps the callbacks installed
    master.register_lock_callbacks(callbacks);

    Ok(Rig {
        gate,
        clock,
        stats,
        provider,
    })
}

#[test]
fn test_driver_granted_before_first_cycle() -> anyhow::Result<()> {
    let rig = rig()?;
    let bus = rig.provider.bus();

    rig.clock.advance_by(Duration::from_secs(1));
    assert_eq!(bus.driver_request(), Admission::Granted);
    assert_eq!(rig.gate.shared_lock().state(), LockState::Free);
    assert_eq!(bus.journal().last(), Some(&BusOp::DriverRequest));
    Ok(())
}

#[test]
fn test_driver_denied_in_inhibit_time_then_granted_next_cycle() -> anyhow::Result<()> {
    let rig = rig()?;
    let bus = rig.provider.bus();
    bus.clear_journal();

    rig.gate.mark_cycle_start(rig.clock.now());
    rig.clock.advance_by(PERIOD - INHIBIT);
    assert_eq!(bus.driver_request(), Admission::Granted);

    rig.clock.advance(1);
    assert_eq!(bus.driver_request(), Admission::Denied);
    assert_eq!(rig.gate.shared_lock().state(), LockState::Free);

    let delay = rig.gate.retry_delay(rig.clock.now());
    assert!(delay <= INHIBIT);
    rig.clock.advance_by(delay);
    rig.gate.mark_cycle_start(rig.clock.now());
    assert_eq!(bus.driver_request(), Admission::Granted);

    let driver_ops = bus
        .journal()
        .iter()
        .filter(|op| **op == BusOp::DriverRequest)
        .count();
    assert_eq!(driver_ops, 2);

    let stats = rig.stats.snapshot();
    assert_eq!((stats.granted, stats.denied), (2, 1));
    Ok(())
}

#[test]
fn test_denial_never_blocks_on_held_lock() -> anyhow::Result<()> {
    let rig = rig()?;
    let bus = rig.provider.bus();

    rig.gate.mark_cycle_start(rig.clock.now());
    rig.clock.advance_by(PERIOD - INHIBIT / 2);
    rig.gate.shared_lock().acquire(Holder::Cycle);

    // a blocking path would hang the driver thread until the release below
    let driver = thread::spawn(move || bus.driver_request());
    let admission = driver
        .join()
        .map_err(|_| anyhow::anyhow!("driver thread panicked"))?;
    assert_eq!(admission, Admission::Denied);
    assert_eq!(rig.gate.shared_lock().state(), LockState::HeldByCycle);

    rig.gate.shared_lock().release(Holder::Cycle)?;
    Ok(())
}

#[test]
fn test_granted_driver_waits_for_cycle_phase() -> anyhow::Result<()> {
    let rig = rig()?;
    let bus = rig.provider.bus();

    rig.gate.mark_cycle_start(rig.clock.now());
    rig.gate.shared_lock().acquire(Holder::Cycle);

    let driver = thread::spawn(move || bus.driver_request());
    thread::sleep(Duration::from_millis(20));
    assert!(!driver.is_finished());

    rig.gate.shared_lock().release(Holder::Cycle)?;
    let admission = driver
        .join()
        .map_err(|_| anyhow::anyhow!("driver thread panicked"))?;
    assert_eq!(admission, Admission::Granted);
    Ok(())
}
