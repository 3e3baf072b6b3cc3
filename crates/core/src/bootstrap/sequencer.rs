//! Staged callback registry and phase latches

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};

use super::state::{BootstrapState, Stage, StateLatch};
use crate::runtime::Runtime;

new_key_type! {
    /// Key for a registered stage callback
    pub struct CallbackKey;
}

/// Callback run once when its stage is reached
pub type StageCallback = Box<dyn FnOnce(&Runtime) + Send>;

/// Error type for callback registration
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Stage '{0}' has already run")]
    StageClosed(Stage),
}

struct Registered {
    name: String,
    callback: StageCallback,
}

#[derive(Default)]
struct Registry {
    callbacks: SlotMap<CallbackKey, Registered>,
    order: [Vec<CallbackKey>; 4],
    closed: [bool; 4],
}

/// Owns the bootstrap state and the per-stage callbacks
pub struct BootstrapSequencer {
    state: StateLatch,
    aborted: AtomicBool,
    registry: Mutex<Registry>,
}

impl BootstrapSequencer {
    pub fn new() -> Self {
        Self {
            state: StateLatch::new(),
            aborted: AtomicBool::new(false),
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state.get()
    }

    /// Whether a fatal failure cancelled the remaining callbacks
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    pub(crate) fn latch(&self) -> &StateLatch {
        &self.state
    }

    /// Queue `callback` for `stage`; callbacks of a stage run in
    /// registration order
    pub fn register<F>(
        &self,
        stage: Stage,
        name: &str,
        callback: F,
    ) -> Result<CallbackKey, BootstrapError>
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        let mut registry = self.registry.lock();
        if registry.closed[stage.index()] {
            tracing::warn!("Callback '{}' registered after {} ran", name, stage);
            return Err(BootstrapError::StageClosed(stage));
        }

        let key = registry.callbacks.insert(Registered {
            name: name.to_string(),
            callback: Box::new(callback),
        });
        registry.order[stage.index()].push(key);

        tracing::debug!("Registered {} callback '{}'", stage, name);
        Ok(key)
    }

    /// Drop a callback that has not run yet
    ///
    /// # Returns
    /// `true` if the callback was found and removed
    pub fn unregister(&self, key: CallbackKey) -> bool {
        let mut registry = self.registry.lock();
        let removed = registry.callbacks.remove(key).is_some();
        if removed {
            for order in registry.order.iter_mut() {
                order.retain(|k| *k != key);
            }
        }
        removed
    }

    /// Callbacks still waiting for `stage`
    pub fn pending(&self, stage: Stage) -> usize {
        self.registry.lock().order[stage.index()].len()
    }

    /// Close `stage` and take its callbacks out of the registry
    fn take_stage(&self, stage: Stage) -> Vec<Registered> {
        let mut registry = self.registry.lock();
        registry.closed[stage.index()] = true;

        let keys = std::mem::take(&mut registry.order[stage.index()]);
        keys.into_iter()
            .filter_map(|key| registry.callbacks.remove(key))
            .collect()
    }

    /// Run every callback of `stage`, or discard them if bootstrap was aborted
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// register callbacks for later stages.
    pub(crate) fn run_stage(&self, runtime: &Runtime, stage: Stage) {
        let callbacks = self.take_stage(stage);

        if self.is_aborted() {
            if !callbacks.is_empty() {
                tracing::warn!(
                    "Skipping {} {} callbacks, bootstrap aborted",
                    callbacks.len(),
                    stage
                );
            }
            return;
        }

        tracing::debug!("Running {} {} callbacks", callbacks.len(), stage);

        for Registered { name, callback } in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(runtime)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("{} callback '{}' panicked: {}", stage, name, message);
            }
        }
    }
}

impl Default for BootstrapSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BootstrapSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapSequencer")
            .field("state", &self.state())
            .field("aborted", &self.is_aborted())
            .field("callbacks", &self.registry.lock().callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_unregister() {
        let sequencer = BootstrapSequencer::new();

        let a = sequencer.register(Stage::Load, "a", |_| {}).unwrap();
        let _b = sequencer.register(Stage::Load, "b", |_| {}).unwrap();
        sequencer.register(Stage::Preload, "c", |_| {}).unwrap();

        assert_eq!(sequencer.pending(Stage::Load), 2);
        assert_eq!(sequencer.pending(Stage::Preload), 1);

        assert!(sequencer.unregister(a));
        assert!(!sequencer.unregister(a));
        assert_eq!(sequencer.pending(Stage::Load), 1);
    }

    #[test]
    fn test_taken_stage_is_closed() {
        let sequencer = BootstrapSequencer::new();
        sequencer.register(Stage::Preload, "early", |_| {}).unwrap();

        let taken = sequencer.take_stage(Stage::Preload);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].name, "early");
        assert_eq!(sequencer.pending(Stage::Preload), 0);

        assert!(matches!(
            sequencer.register(Stage::Preload, "late", |_| {}),
            Err(BootstrapError::StageClosed(Stage::Preload))
        ));
        assert!(sequencer.register(Stage::Load, "later", |_| {}).is_ok());
    }

    #[test]
    fn test_abort_flag() {
        let sequencer = BootstrapSequencer::new();
        assert!(!sequencer.is_aborted());
        sequencer.abort();
        assert!(sequencer.is_aborted());
        assert_eq!(sequencer.state(), BootstrapState::NotStarted);
    }
}
