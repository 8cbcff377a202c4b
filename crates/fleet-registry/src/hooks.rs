//! Per-kind hook points run by the registry around writes and reads.

use crate::error::RegistryResult;
use crate::object::{Object, Spec};

/// Kind-specific behaviour plugged into a [`Registry`](crate::Registry).
///
/// Writes run `validate → mutate → pre_create | pre_update` before
/// persisting; `post_create` runs after a successful create. `decorate`
/// enriches objects handed out by reads and watches and is never persisted.
pub trait RegistryHooks<S: Spec>: Send + Sync {
    fn validate(&self, _obj: &Object<S>) -> RegistryResult<()> {
        Ok(())
    }

    fn mutate(&self, _obj: &mut Object<S>) -> RegistryResult<()> {
        Ok(())
    }

    fn pre_create(&self, _obj: &mut Object<S>) -> RegistryResult<()> {
        Ok(())
    }

    fn post_create(&self, _obj: &Object<S>) {}

    fn pre_update(&self, _old: &Object<S>, _new: &mut Object<S>) -> RegistryResult<()> {
        Ok(())
    }

    fn decorate(&self, _obj: &mut Object<S>) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<S: Spec> RegistryHooks<S> for NoHooks {}
