//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Test logging setup
//! - Standard exchange configurations
//! - Inspecting the simulated bus journal

use pdx_common::config::{BindingConfig, ExchangeConfig};
use pdx_fieldbus::BusOp;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once per test binary.
///
/// Honors `RUST_LOG`; defaults to warnings only.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// One entry of the demo mapping table.
pub fn binding(name: &str, slave: &str, index: u16, bit_len: u8) -> BindingConfig {
    BindingConfig {
        name: name.into(),
        slave: slave.into(),
        vendor_id: 0x0000_0002,
        product_code: 0x07d4_3052,
        index,
        subindex: 1,
        bit_len,
    }
}

/// Demo exchange: digital outputs, an analog output and a counter value.
///
/// Real-time scheduling stays disabled so the tests run unprivileged.
pub fn demo_config(frequency_hz: u32, inhibit: Duration, status_interval: u32) -> ExchangeConfig {
    ExchangeConfig {
        frequency_hz,
        inhibit_time: inhibit,
        status_interval_cycles: Some(status_interval),
        bindings: vec![
            binding("dig_out", "2", 0x3001, 8),
            binding("ana_out", "3", 0x6411, 16),
            binding("count", "#888:1", 0x6000, 32),
        ],
        ..Default::default()
    }
}

/// Receive and send entries of `journal`, in order.
pub fn exchange_ops(journal: &[BusOp]) -> Vec<BusOp> {
    journal
        .iter()
        .filter(|op| matches!(op, BusOp::Receive | BusOp::Send))
        .cloned()
        .collect()
}

/// True if receive and send strictly alternate, starting with a receive.
pub fn receive_send_alternate(ops: &[BusOp]) -> bool {
    ops.iter().enumerate().all(|(i, op)| {
        if i % 2 == 0 {
            *op == BusOp::Receive
        } else {
            *op == BusOp::Send
        }
    })
}
