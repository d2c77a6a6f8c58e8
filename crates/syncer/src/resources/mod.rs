//! Built-in synced kinds.

use std::sync::Arc;

use vcsync_core::{Result, SyncConfig};
use vcsync_mappings::resources::{priority_classes_mapper, storage_classes_mapper};
use vcsync_mappings::MapperRegistry;

use crate::plugin::SyncerSet;

pub mod priorityclasses;
pub mod storageclasses;

pub use priorityclasses::PriorityClassSyncer;
pub use storageclasses::StorageClassSyncer;

/// Mappers for every built-in kind, and syncers for the enabled ones.
/// Disabled kinds get a mirror mapper and no syncer.
pub fn builtin(cfg: &SyncConfig) -> Result<(MapperRegistry, SyncerSet)> {
    cfg.validate()?;
    let mut mappers = MapperRegistry::new();
    let mut syncers = SyncerSet::new();

    mappers.register(priority_classes_mapper(cfg))?;
    if cfg.sync_priority_classes {
        syncers.register(Arc::new(PriorityClassSyncer::new(cfg)))?;
    }
    mappers.register(storage_classes_mapper(cfg))?;
    if cfg.sync_storage_classes {
        syncers.register(Arc::new(StorageClassSyncer::new()))?;
    }

    syncers.validate(&mappers)?;
    Ok((mappers, syncers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcsync_core::TenantConfig;
    use vcsync_mappings::resources::{priority_class_kind, storage_class_kind};

    #[test]
    fn defaults_sync_priority_classes_only() {
        let cfg = SyncConfig::new(TenantConfig::new("host", "s"));
        let (mappers, syncers) = builtin(&cfg).unwrap();
        assert_eq!(mappers.len(), 2);
        assert_eq!(syncers.len(), 1);
        assert!(syncers.get(&priority_class_kind()).is_ok());
        assert!(mappers.resolve(&storage_class_kind()).unwrap().is_mirror());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = SyncConfig::new(TenantConfig::new("", "s"));
        assert!(builtin(&cfg).is_err());
    }
}
