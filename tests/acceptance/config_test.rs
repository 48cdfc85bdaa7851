//! Exchange configuration loaded from TOML files.

use super::common::init_tracing;
use pdx_common::config::{CpuAffinity, ExchangeConfig, SchedPolicy};
use pdx_fieldbus::{registrations_from_config, SimulatedProvider};
use pdx_runtime::{BlinkLogic, CriticalWindow, ExchangeBuilder, ThreadScheduler};
use std::io::Write;
use std::thread;
use std::time::Duration;

const DEMO_TOML: &str = r##"
master_index = 0
frequency_hz = 1000
inhibit_time = "100us"
status_interval_cycles = 50

[task]
name = "pdx-demo"
priority = 80

[realtime]
enabled = false
policy = "fifo"
cpu_affinity = [2, 3]

[[bindings]]
name = "dig_out"
slave = "2"
vendor_id = 2
product_code = 0x07d43052
index = 0x3001
subindex = 1
bit_len = 8

[[bindings]]
name = "count"
slave = "#888:1"
vendor_id = 2
product_code = 0x13ed3052
index = 0x6000
subindex = 1
bit_len = 32
"##;

fn write_config(content: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test]
fn test_load_config_file() -> anyhow::Result<()> {
    init_tracing();
    let file = write_config(DEMO_TOML)?;

    let config = ExchangeConfig::from_file(file.path())?;
    config.validate()?;

    assert_eq!(config.cycle_period(), Duration::from_millis(1));
    let window = CriticalWindow::from_config(&config)?;
    assert_eq!(window.window(), Duration::from_micros(900));
    assert_eq!(config.status_interval(), 50);
    assert_eq!(config.task.name, "pdx-demo");
    assert_eq!(config.realtime.policy, SchedPolicy::Fifo);
    assert_eq!(config.realtime.cpu_affinity, CpuAffinity::Set(vec![2, 3]));

    let registrations = registrations_from_config(&config.bindings)?;
    assert_eq!(registrations.len(), 2);
    assert_eq!(registrations[1].slave.to_string(), "#888:1");
    Ok(())
}

#[test]
fn test_start_from_config_file() -> anyhow::Result<()> {
    init_tracing();
    let file = write_config(DEMO_TOML)?;
    let config = ExchangeConfig::from_file(file.path())?;

    let mut provider = SimulatedProvider::new();
    let exchange = ExchangeBuilder::new(config).start(
        &mut provider,
        ThreadScheduler::new(),
        |table| BlinkLogic::new(table, "dig_out"),
    )?;
    thread::sleep(Duration::from_millis(20));
    let stats = exchange.stats();
    exchange.shutdown()?;

    assert!(stats.cycles > 0);
    Ok(())
}

#[test]
fn test_rejects_inhibit_longer_than_period() -> anyhow::Result<()> {
    init_tracing();
    let file = write_config(&DEMO_TOML.replace("\"100us\"", "\"2ms\""))?;
    let config = ExchangeConfig::from_file(file.path())?;
    assert!(config.validate().is_err());

    let mut provider = SimulatedProvider::new();
    let bus = provider.bus();
    let result = ExchangeBuilder::new(config).start(
        &mut provider,
        ThreadScheduler::new(),
        |table| BlinkLogic::new(table, "dig_out"),
    );
    assert!(result.is_err());
    assert!(bus.journal().is_empty());
    Ok(())
}

#[test]
fn test_rejects_bad_slave_address() -> anyhow::Result<()> {
    let file = write_config(&DEMO_TOML.replace("\"#888:1\"", "\"#888\""))?;
    let config = ExchangeConfig::from_file(file.path())?;
    assert!(registrations_from_config(&config.bindings).is_err());
    Ok(())
}

#[test]
fn test_missing_file() {
    let result = ExchangeConfig::from_file(std::path::Path::new("/nonexistent/pdx.toml"));
    assert!(result.is_err());
}
