//! Full exchange lifecycle on a real periodic thread.
//!
//! # Acceptance Criteria
//!
//! - Receive and send strictly alternate across all cycles
//! - No two bus operations overlap, with asynchronous callers active
//! - Status changes are reported once per change
//! - Teardown releases domain then master, and closes the gate

use super::common::{demo_config, exchange_ops, init_tracing, receive_send_alternate};
use pdx_common::error::PdxError;
use pdx_common::state::TaskState;
use pdx_fieldbus::{
    Admission, BusMaster, BusOp, BusStatus, DomainId, FailurePoint, SimulatedProvider,
    StatusSnapshot,
};
use pdx_runtime::{BlinkLogic, ExchangeBuilder, Refusal, StatusChange, StatusField, ThreadScheduler};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn test_exchange_with_concurrent_async_callers() -> anyhow::Result<()> {
    init_tracing();

    let mut provider = SimulatedProvider::new();
    let bus = provider.bus();
    let changes = Arc::new(Mutex::new(Vec::<StatusChange>::new()));
    let sink_changes = Arc::clone(&changes);

    let config = demo_config(1000, Duration::from_micros(100), 10);
    let exchange = ExchangeBuilder::new(config)
        .status_sink(Box::new(move |change: &StatusChange| {
            sink_changes.lock().unwrap().push(*change);
        }))
        .start(&mut provider, ThreadScheduler::new(), |table| {
            BlinkLogic::new(table, "dig_out")
        })?;
    assert_eq!(exchange.state(), TaskState::Running);
    assert_eq!(exchange.bindings().len(), 3);

    let running = Arc::new(AtomicBool::new(true));
    let granted = Arc::new(AtomicU64::new(0));

    let app = {
        let access = exchange.access();
        let running = Arc::clone(&running);
        let granted = Arc::clone(&granted);
        thread::spawn(move || {
            while running.load(Ordering::Acquire) {
                if let Ok(Ok(_status)) = access.with_retry(5, |master| master.status()) {
                    granted.fetch_add(1, Ordering::Relaxed);
                }
                thread::sleep(Duration::from_micros(300));
            }
        })
    };
    let driver = {
        let bus = Arc::clone(&bus);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let mut denied = 0u64;
            while running.load(Ordering::Acquire) {
                if bus.driver_request() == Admission::Denied {
                    denied += 1;
                }
                thread::sleep(Duration::from_micros(170));
            }
            denied
        })
    };

    thread::sleep(Duration::from_millis(60));
    bus.set_status(StatusSnapshot {
        bus_status: BusStatus::Ok,
        tainted: false,
        slaves_responding: 3,
    });
    thread::sleep(Duration::from_millis(100));

    running.store(false, Ordering::Release);
    app.join().expect("application thread panicked");
    let _denied = driver.join().expect("driver thread panicked");

    let stats = exchange.stats();
    let access = exchange.access();
    exchange.shutdown()?;

    assert!(stats.cycles >= 20, "only {} cycles ran", stats.cycles);
    assert_eq!(stats.receive_failures, 0);
    assert_eq!(stats.send_failures, 0);
    assert!(granted.load(Ordering::Relaxed) > 0);
    assert_eq!(bus.exclusion_violations(), 0);

    let journal = bus.journal();
    let ops = exchange_ops(&journal);
    assert!(!ops.is_empty());
    assert!(receive_send_alternate(&ops), "receive/send interleaving broken");

    let changes = changes.lock().unwrap();
    let responding: Vec<_> = changes
        .iter()
        .filter(|c| c.field == StatusField::SlavesResponding)
        .collect();
    assert_eq!(responding.len(), 1, "changes: {changes:?}");
    assert_eq!((responding[0].old, responding[0].new), (0, 3));

    let tail = &journal[journal.len() - 2..];
    assert_eq!(tail, [BusOp::ReleaseDomain(DomainId(0)), BusOp::Release]);
    assert_eq!(access.try_with(|_| ()), Err(Refusal::Closed));
    assert_eq!(bus.driver_request(), Admission::Closed);
    Ok(())
}

#[test]
fn test_send_failures_do_not_stop_the_loop() -> anyhow::Result<()> {
    init_tracing();

    let mut provider = SimulatedProvider::new();
    let bus = provider.bus();
    let exchange = ExchangeBuilder::new(demo_config(1000, Duration::from_micros(100), 1000))
        .start(&mut provider, ThreadScheduler::new(), |table| {
            BlinkLogic::new(table, "dig_out")
        })?;

    bus.fail_at(FailurePoint::Send);
    thread::sleep(Duration::from_millis(30));
    let failing = exchange.stats();
    bus.clear_failure(FailurePoint::Send);
    thread::sleep(Duration::from_millis(30));
    let recovered = exchange.stats();
    exchange.shutdown()?;

    assert!(failing.send_failures > 0);
    assert!(recovered.cycles > failing.cycles);
    assert!(recovered.send_failures < recovered.cycles);
    Ok(())
}

#[test]
fn test_activation_failure_rolls_back() {
    init_tracing();

    let mut provider = SimulatedProvider::new();
    let bus = provider.bus();
    bus.fail_at(FailurePoint::Activate);

    let result = ExchangeBuilder::new(demo_config(1000, Duration::from_micros(100), 1000)).start(
        &mut provider,
        ThreadScheduler::new(),
        |table| BlinkLogic::new(table, "dig_out"),
    );

    match result {
        Err(PdxError::Setup { step, .. }) => assert_eq!(step, "activate"),
        other => panic!("expected activation failure, got {other:?}"),
    }
    assert_eq!(
        bus.journal(),
        vec![
            BusOp::RequestMaster(0),
            BusOp::RegisterCallbacks,
            BusOp::CreateDomain(DomainId(0)),
            BusOp::RegisterBindings(DomainId(0), 3),
            BusOp::ReleaseDomain(DomainId(0)),
            BusOp::Release,
        ]
    );
}

#[test]
fn test_blink_reaches_the_wire() -> anyhow::Result<()> {
    init_tracing();

    let mut provider = SimulatedProvider::new();
    let bus = provider.bus();
    // flip every cycle so both patterns show up quickly
    let exchange = ExchangeBuilder::new(demo_config(1000, Duration::from_micros(100), 1))
        .start(&mut provider, ThreadScheduler::new(), |table| {
            BlinkLogic::new(table, "dig_out")
        })?;
    let offset = exchange
        .bindings()
        .get("dig_out")
        .map(|b| b.offset)
        .ok_or_else(|| anyhow::anyhow!("dig_out not bound"))?;

    let mut seen = Vec::new();
    for _ in 0..40 {
        seen.push(bus.wire()[offset]);
        thread::sleep(Duration::from_micros(700));
    }
    exchange.shutdown()?;

    assert!(seen.contains(&0x0F), "wire samples: {seen:?}");
    assert!(seen.iter().all(|v| *v == 0x0F || *v == 0x00));
    Ok(())
}
