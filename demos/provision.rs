//! Provisioning demo against the in-memory lab, happy and unhappy paths.
//!
//! Run with: cargo run --example provision [-- path/to/devrig.toml]

use std::sync::Arc;

use devrig::config::SuiteConfig;
use devrig::logging::init_tracing;
use devrig::provision::memory::MemoryLab;
use devrig::provision::{self, ServiceError};
use devrig::ExecutionResult;
use tokio_util::sync::CancellationToken;

const DEMO_CONFIG: &str = r#"
[general]
log_level = "info"
log_format = "pretty"

[suite]
id = "devrig-demo"
device_type = "raspberrypi4-64"
register_settle_ms = 200

[balena]
api_key = "demo-token"
organization = "demo"

[network]
wired = true

[poll]
interval_ms = 100
timeout_ms = 2000

[run]
deadline_ms = 30000
"#;

async fn load_config() -> anyhow::Result<SuiteConfig> {
    match std::env::args().nth(1) {
        Some(path) => Ok(SuiteConfig::load(path).await?),
        None => {
            let mut config = SuiteConfig::parse(DEMO_CONFIG)?;
            config.general.tmpdir = std::env::temp_dir().join("devrig-demo");
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn provision(config: &SuiteConfig, lab: &Arc<MemoryLab>) -> anyhow::Result<()> {
    let run = provision::prepare(config, lab.services(), CancellationToken::new()).await?;

    match run.start().await {
        ExecutionResult::Completed(e) => {
            println!("  provisioned in phase {:?}", e.phase());
            println!(
                "  device {}",
                e.context().state.require::<String>("balena.uuid")?
            );
        }
        ExecutionResult::Failed(e, error) => {
            println!("  failed: {error}");
            println!(
                "  teardown ran {} actions, {} failed",
                e.teardown_report().executed,
                e.teardown_report().failures.len()
            );
        }
    }

    println!("  applications left: {:?}", lab.applications());
    println!("  ssh keys left: {:?}", lab.ssh_keys());
    println!("  worker released: {}", lab.worker_released());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().await?;
    init_tracing(&config.general)?;

    println!("=== Happy path ===");
    let lab = MemoryLab::new();
    lab.online_after(3);
    lab.fail_next(
        "cloud.execute_in_host_os",
        2,
        ServiceError::Unavailable("tunnel not ready".to_owned()),
    );
    provision(&config, &lab).await?;

    println!("\n=== Flashing fails ===");
    let lab = MemoryLab::new();
    lab.fail_on(
        "worker.flash",
        ServiceError::Rejected("no boot media".to_owned()),
    );
    provision(&config, &lab).await?;

    Ok(())
}
