use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::notify::NotifyHub;

/// Per-tenant (company) engines. Each tenant gets its own Engine and WAL file
/// `<data_dir>/<escaped tenant>.wal`; tenants share nothing.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    /// Lowercased WAL file name -> owning tenant. Guards filesystems that
    /// ignore case.
    files: DashMap<String, String>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

/// Reversible, path-safe file stem of a tenant name.
fn wal_stem(tenant: &str) -> io::Result<String> {
    if tenant.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty tenant name"));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "tenant name too long"));
    }
    let stem = urlencoding::encode(tenant).into_owned();
    // "." and ".." survive encoding unchanged.
    Ok(stem.replace('.', "%2E"))
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            files: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get or lazily create the engine of `tenant`, replaying its WAL.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let stem = wal_stem(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many tenants"));
        }
        {
            let owner = self
                .files
                .entry(stem.to_lowercase())
                .or_insert_with(|| tenant.to_string());
            if owner.value() != tenant {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("tenant {tenant} clashes with {} on disk", owner.value()),
                ));
            }
        }

        let wal_path = self.data_dir.join(format!("{stem}.wal"));
        let engine = self
            .engines
            .entry(tenant.to_string())
            .or_try_insert_with(|| {
                Engine::new(tenant, wal_path, Arc::new(NotifyHub::new())).map(Arc::new)
            })?
            .value()
            .clone();
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Tenant names with a WAL file in the data directory.
    pub fn discover(&self) -> io::Result<Vec<String>> {
        let mut tenants = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "wal")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                && let Ok(tenant) = urlencoding::decode(stem)
            {
                tenants.push(tenant.into_owned());
            }
        }
        tenants.sort();
        Ok(tenants)
    }

    /// Compact the tenant's WAL when enough appends have accumulated.
    /// Returns whether it compacted.
    pub async fn compact_if_needed(&self, tenant: &str) -> Result<bool, EngineError> {
        let engine = self
            .get_or_create(tenant)
            .map_err(|e| EngineError::Infrastructure(e.to_string()))?;
        let appends = engine.wal_appends_since_compact().await;
        if appends < self.compact_threshold {
            return Ok(false);
        }
        engine.compact_wal().await?;
        info!("tenant {tenant}: compacted WAL after {appends} appends");
        Ok(true)
    }
}
