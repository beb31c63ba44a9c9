//! Per-entity lifecycle hooks run around commit-phase writes.
//!
//! Hooks are registered per entity name. `before_*` hooks run right before the
//! entity's write is issued and may abort the commit by returning `Err`;
//! `after_*` hooks are queued and only run once every store has committed.

use crate::entity::EntityRef;
use entitymap_core::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Callbacks for one entity type. Every method defaults to a no-op.
pub trait LifecycleHooks: Send + Sync {
    fn before_create(&self, _entity: &EntityRef) -> Result<()> {
        Ok(())
    }

    fn after_create(&self, _entity: &EntityRef) {}

    fn before_update(&self, _entity: &EntityRef) -> Result<()> {
        Ok(())
    }

    fn after_update(&self, _entity: &EntityRef) {}

    fn before_remove(&self, _entity: &EntityRef) -> Result<()> {
        Ok(())
    }

    fn after_remove(&self, _entity: &EntityRef) {}
}

/// The write a hook surrounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Create,
    Update,
    Remove,
}

/// An `after_*` callback waiting for the commit to succeed.
#[derive(Debug, Clone)]
pub struct QueuedHook {
    pub kind: HookKind,
    pub entity: EntityRef,
}

/// Hooks keyed by entity name.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn LifecycleHooks>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entities: Vec<&String> = self.hooks.keys().collect();
        entities.sort();
        f.debug_struct("HookRegistry")
            .field("entities", &entities)
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register hooks for `entity`, replacing any previous registration.
    pub fn register(&mut self, entity: impl Into<String>, hooks: Arc<dyn LifecycleHooks>) {
        self.hooks.insert(entity.into(), hooks);
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.hooks.contains_key(entity)
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run the `before_*` hook for `entity`, if one is registered.
    #[allow(clippy::result_large_err)]
    pub fn run_before(&self, kind: HookKind, entity: &EntityRef) -> Result<()> {
        let Some(hooks) = self.hooks.get(entity.entity()) else {
            return Ok(());
        };
        tracing::trace!(entity = %entity.entity(), id = %entity.id(), ?kind, "Running before hook");
        match kind {
            HookKind::Create => hooks.before_create(entity),
            HookKind::Update => hooks.before_update(entity),
            HookKind::Remove => hooks.before_remove(entity),
        }
    }

    /// Run a queued `after_*` hook.
    pub fn run_after(&self, queued: &QueuedHook) {
        let Some(hooks) = self.hooks.get(queued.entity.entity()) else {
            return;
        };
        match queued.kind {
            HookKind::Create => hooks.after_create(&queued.entity),
            HookKind::Update => hooks.after_update(&queued.entity),
            HookKind::Remove => hooks.after_remove(&queued.entity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::{Error, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    impl LifecycleHooks for Recorder {
        fn before_create(&self, entity: &EntityRef) -> Result<()> {
            self.calls.lock().unwrap().push("before_create");
            if entity.get("title") == Some(Value::from("reject")) {
                return Err(Error::Custom("rejected".into()));
            }
            Ok(())
        }

        fn after_remove(&self, _entity: &EntityRef) {
            self.calls.lock().unwrap().push("after_remove");
        }
    }

    #[test]
    fn test_unregistered_entities_pass() {
        let registry = HookRegistry::new();
        let book = EntityRef::new("Book");
        assert!(registry.run_before(HookKind::Create, &book).is_ok());
        registry.run_after(&QueuedHook {
            kind: HookKind::Remove,
            entity: book,
        });
    }

    #[test]
    fn test_before_hook_can_abort() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = HookRegistry::new();
        registry.register("Book", recorder.clone());

        let ok = EntityRef::new("Book").with("title", "Dune");
        let bad = EntityRef::new("Book").with("title", "reject");
        assert!(registry.run_before(HookKind::Create, &ok).is_ok());
        assert!(registry.run_before(HookKind::Create, &bad).is_err());
        assert!(registry.run_before(HookKind::Update, &ok).is_ok());

        registry.run_after(&QueuedHook {
            kind: HookKind::Remove,
            entity: ok,
        });
        assert_eq!(
            *recorder.calls.lock().unwrap(),
            vec!["before_create", "before_create", "after_remove"]
        );
    }
}
