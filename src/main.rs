use std::process::ExitCode;

use tracing::{error, info, warn};

use roomledger::config::Config;
use roomledger::tenant::TenantManager;

/// Maintenance run: replay every tenant's WAL, audit the booking invariants,
/// and compact logs that have grown past the threshold when asked to.
#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    roomledger::observability::init_tracing();
    let config = Config::from_env();
    roomledger::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let tenants = TenantManager::new(config.data_dir.clone(), config.compact_threshold);
    let names = tenants.discover()?;
    info!("roomledger maintenance");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tenants: {}", names.len());
    info!("  compact_on_audit: {}", config.compact_on_audit);

    let mut dirty = 0usize;
    for name in &names {
        let engine = match tenants.get_or_create(name) {
            Ok(engine) => engine,
            Err(e) => {
                error!("tenant {name}: cannot replay WAL: {e}");
                dirty += 1;
                continue;
            }
        };
        let violations = engine.audit().await;
        if violations.is_empty() {
            info!("tenant {name}: ok");
        } else {
            dirty += 1;
            for violation in &violations {
                warn!("tenant {name}: {}", serde_json::to_string(violation)?);
            }
        }
        if config.compact_on_audit
            && let Err(e) = tenants.compact_if_needed(name).await
        {
            error!("tenant {name}: compaction failed: {e}");
        }
    }

    Ok(if dirty == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
