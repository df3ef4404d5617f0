//! Caller-held handles to a resource request.

use std::sync::{Arc, Weak};

use crate::manager::AsyncResourceManager;
use crate::unit::{ResourceUnit, ResourceUnitStatus};

/// A caller's reference to one resource unit. Dropping it defers a
/// reference-count decrement to the owning manager's current frame bucket
/// (`§4.G`'s `RequestUnloadResourceUnit`) rather than adjusting the count
/// synchronously, so a binder can be dropped from any thread without
/// racing the manager's unload scheduling.
pub struct ResourceBinder {
    unit: Arc<ResourceUnit>,
    manager: Weak<AsyncResourceManager>,
    released: bool,
}

impl ResourceBinder {
    pub(crate) fn new(unit: Arc<ResourceUnit>, manager: Weak<AsyncResourceManager>) -> Self {
        unit.adjust_reference_count(1);
        Self { unit, manager, released: false }
    }

    /// Blocks until the underlying unit finishes loading, then returns its
    /// terminal status.
    pub fn wait_for_load(&self) -> ResourceUnitStatus {
        self.unit.wait_for_load()
    }

    #[must_use]
    pub fn status(&self) -> ResourceUnitStatus {
        self.unit.status()
    }

    #[must_use]
    pub fn file_path(&self) -> &str {
        self.unit.file_path()
    }

    /// The underlying unit's current `reference_count`, including this
    /// binder's own contribution.
    #[must_use]
    pub fn reference_count(&self) -> i64 {
        self.unit.reference_count()
    }

    /// Two binders for the same path (obtained while the first was still
    /// in flight) observe the same unit.
    #[must_use]
    pub fn points_to_same_unit(&self, other: &ResourceBinder) -> bool {
        Arc::ptr_eq(&self.unit, &other.unit)
    }

    pub(crate) fn unit(&self) -> &Arc<ResourceUnit> {
        &self.unit
    }
}

impl Drop for ResourceBinder {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(manager) = self.manager.upgrade() {
            manager.request_unload_resource_unit(&self.unit);
        } else {
            self.unit.adjust_reference_count(-1);
        }
    }
}
