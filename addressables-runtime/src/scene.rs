//! Scene instance lifecycle
//!
//! Associates each loaded scene with its owning operation handle so a
//! host-driven "scene unloaded" notification can find and release the
//! backing load without the caller tracking it manually.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::engine::{OperationEngine, UntypedHandle};

/// A loaded scene: its address plus a runtime-unique instance id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneInstance {
    name: String,
    instance_id: u64,
}

impl SceneInstance {
    pub fn new<N: Into<String>>(name: N, instance_id: u64) -> Self {
        Self {
            name: name.into(),
            instance_id,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }
}

struct SceneRecord {
    instance: Arc<SceneInstance>,
    handle: UntypedHandle,
    /// Host already unloaded the scene; the handle only carries
    /// pending-release bookkeeping from here on
    unloaded: bool,
}

/// Result of processing an external scene-unloaded notification
pub struct SceneReleased {
    pub instance: Arc<SceneInstance>,
    /// The backing handle was fully released (no other holders remained)
    pub fully_released: bool,
}

/// Active set of scene handles
#[derive(Default)]
pub struct SceneTracker {
    records: Mutex<HashMap<u64, SceneRecord>>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SceneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a completed scene handle to the active set
    pub fn track(&self, instance: Arc<SceneInstance>, handle: UntypedHandle) {
        debug!(scene = instance.name(), id = instance.instance_id(), "tracking scene instance");
        lock_recover(&self.records).insert(
            instance.instance_id(),
            SceneRecord {
                instance,
                handle,
                unloaded: false,
            },
        );
    }

    /// Number of scenes still considered loaded by the host
    pub fn active_count(&self) -> usize {
        lock_recover(&self.records)
            .values()
            .filter(|r| !r.unloaded)
            .count()
    }

    pub fn contains(&self, instance_id: u64) -> bool {
        lock_recover(&self.records).contains_key(&instance_id)
    }

    pub fn is_unloaded(&self, instance_id: u64) -> Option<bool> {
        lock_recover(&self.records)
            .get(&instance_id)
            .map(|r| r.unloaded)
    }

    /// Process a host notification that a scene was unloaded externally.
    ///
    /// Finds the matching entry by scene identity and releases the owning
    /// handle exactly once, so the bundle references behind the scene's
    /// assets are decremented even if the caller never released the handle.
    pub fn notify_scene_unloaded(
        &self,
        engine: &OperationEngine,
        scene_name: &str,
    ) -> Option<SceneReleased> {
        let (instance_id, instance, handle, last_holder) = {
            let mut records = lock_recover(&self.records);
            let instance_id = records
                .iter()
                .find(|(_, r)| r.instance.name() == scene_name && !r.unloaded)
                .map(|(id, _)| *id)?;
            // refcount 1 means our release below is the last; drop the
            // record now. Otherwise keep it flagged: the remaining count is
            // pending-release bookkeeping for the caller's handle.
            let last_holder = records
                .get(&instance_id)
                .map(|r| r.handle.ref_count().unwrap_or(0) <= 1)?;
            if last_holder {
                let record = records.remove(&instance_id)?;
                (instance_id, record.instance, record.handle, true)
            } else {
                let record = records.get_mut(&instance_id)?;
                record.unloaded = true;
                (
                    instance_id,
                    record.instance.clone(),
                    record.handle.clone(),
                    false,
                )
            }
        };

        info!(scene = scene_name, id = instance_id, "scene unloaded externally; releasing");
        engine.release_untyped(&handle);
        Some(SceneReleased {
            instance,
            fully_released: last_holder,
        })
    }

    /// Remove an entry (explicit unload path); returns its instance
    pub fn remove(&self, instance_id: u64) -> Option<Arc<SceneInstance>> {
        lock_recover(&self.records)
            .remove(&instance_id)
            .map(|r| r.instance)
    }
}
