//! Process-scoped configuration. Read once at startup and passed explicitly
//! into every mapper, syncer and driver; nothing here is global.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default ceiling applied to synced priority class values. Host priority
/// values above this are reserved for system-critical classes.
pub const DEFAULT_PRIORITY_CLASS_CEILING: i64 = 1_000_000_000;

/// Identity of one virtual cluster instance inside the host cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TenantConfig {
    /// Host namespace the virtual cluster runs in; namespaced objects collapse into it.
    pub host_namespace: String,
    /// Short token unique per virtual cluster instance.
    pub suffix: String,
}

impl TenantConfig {
    pub fn new(host_namespace: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self { host_namespace: host_namespace.into(), suffix: suffix.into() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host_namespace.is_empty() {
            return Err(Error::config("target host namespace must not be empty"));
        }
        if self.suffix.is_empty() {
            return Err(Error::config("tenant suffix must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub tenant: TenantConfig,
    pub sync_priority_classes: bool,
    pub sync_storage_classes: bool,
    pub priority_class_ceiling: i64,
    /// Concurrent reconciliation workers.
    pub workers: usize,
    /// Deadline for every single store operation.
    pub op_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Consecutive transient failures after which an identity is reported as persistently failing.
    pub persistent_after: u32,
    /// Full relist interval; zero disables periodic resync.
    pub resync_period: Duration,
}

impl SyncConfig {
    pub fn new(tenant: TenantConfig) -> Self {
        Self {
            tenant,
            sync_priority_classes: true,
            sync_storage_classes: false,
            priority_class_ceiling: DEFAULT_PRIORITY_CLASS_CEILING,
            workers: 4,
            op_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            persistent_after: 10,
            resync_period: Duration::from_secs(300),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.tenant.validate()?;
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.op_timeout.is_zero() {
            return Err(Error::config("operation timeout must be positive"));
        }
        if self.backoff_initial.is_zero() || self.backoff_max < self.backoff_initial {
            return Err(Error::config("backoff must satisfy 0 < initial <= max"));
        }
        if self.priority_class_ceiling <= 0 {
            return Err(Error::config("priority class ceiling must be positive"));
        }
        Ok(())
    }
}
