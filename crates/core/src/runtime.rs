//! Runtime context
//!
//! Everything the bootstrap touches hangs off one [`Runtime`]: the host
//! image base, the memory it patches, relocations, trampolines, installed
//! hooks and the staged callbacks. Tests build as many runtimes as they like
//! over synthetic images; the plugin keeps exactly one in a `OnceLock`.

use std::sync::OnceLock;

use earlyhook_engine::{LoadedImage, RelocationManager};
use parking_lot::Mutex;

use crate::bootstrap::{BootstrapError, BootstrapSequencer, BootstrapState, CallbackKey, Stage};
use crate::config::CoreConfig;
use crate::hooks::{HookError, HookRegistry, IatHookKey, PendingHook};
use crate::memory::{MemoryAccess, Patch};
use crate::offsets::{Offsets, OffsetsError};
use crate::rtti;
use crate::trampoline::{TrampolineError, Trampolines};

/// An address inside the module this crate is linked into
fn runtime_anchor() -> usize {
    let f: fn() -> usize = runtime_anchor;
    f as usize
}

/// Runtime state for one host process
pub struct Runtime {
    host_base: usize,
    extension_base: usize,
    memory: Box<dyn MemoryAccess>,
    relocations: OnceLock<RelocationManager>,
    trampolines: Mutex<Option<Trampolines>>,
    hooks: Mutex<HookRegistry>,
    sequencer: BootstrapSequencer,
    config: CoreConfig,
    offsets: Option<Offsets>,
}

impl Runtime {
    /// Create a runtime for the host image loaded at `host_base`
    pub fn new(host_base: usize, memory: Box<dyn MemoryAccess>) -> Self {
        Self {
            host_base,
            extension_base: runtime_anchor(),
            memory,
            relocations: OnceLock::new(),
            trampolines: Mutex::new(None),
            hooks: Mutex::new(HookRegistry::new()),
            sequencer: BootstrapSequencer::new(),
            config: CoreConfig::default(),
            offsets: None,
        }
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Anchor for the local trampoline region, usually the runtime module base
    pub fn with_extension_base(mut self, base: usize) -> Self {
        self.extension_base = base;
        self
    }

    pub fn with_offsets(mut self, offsets: Offsets) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn host_base(&self) -> usize {
        self.host_base
    }

    pub fn extension_base(&self) -> usize {
        self.extension_base
    }

    pub fn memory(&self) -> &dyn MemoryAccess {
        &*self.memory
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn sequencer(&self) -> &BootstrapSequencer {
        &self.sequencer
    }

    pub fn state(&self) -> BootstrapState {
        self.sequencer.state()
    }

    /// Relocations, once phase 1 has recorded the host base
    pub fn relocations(&self) -> Option<&RelocationManager> {
        self.relocations.get()
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Run `callback` once when `stage` is reached
    pub fn register<F>(
        &self,
        stage: Stage,
        name: &str,
        callback: F,
    ) -> Result<CallbackKey, BootstrapError>
    where
        F: FnOnce(&Runtime) + Send + 'static,
    {
        self.sequencer.register(stage, name, callback)
    }

    pub fn unregister(&self, key: CallbackKey) -> bool {
        self.sequencer.unregister(key)
    }

    // ------------------------------------------------------------------
    // Bootstrap events
    // ------------------------------------------------------------------

    /// Phase 1 event, fired from the host's first static-initializer call
    ///
    /// Runs phase 1 if this is the first call, then calls `original` exactly
    /// once and returns its result.
    pub fn preinit_event<R>(&self, original: impl FnOnce() -> R) -> R {
        self.run_preinit();
        original()
    }

    /// Phase 2 event, fired once the host's static initialization is done
    ///
    /// Runs phase 2 if this is the first call (running phase 1 first if it
    /// never happened), then calls `original` exactly once.
    pub fn init_event<R>(&self, original: impl FnOnce() -> R) -> R {
        if self.state() == BootstrapState::NotStarted {
            tracing::warn!("Init event arrived before preinit, running preinit first");
            self.run_preinit();
        }
        self.run_init();
        original()
    }

    fn run_preinit(&self) {
        let latch = self.sequencer.latch();
        if !latch.advance(BootstrapState::NotStarted, BootstrapState::PreinitRunning) {
            tracing::trace!("Preinit already handled ({:?})", latch.get());
            return;
        }

        let relocs = self
            .relocations
            .get_or_init(|| RelocationManager::new(self.host_base));
        tracing::debug!("Host image base {:x}", relocs.base());

        match Trampolines::reserve(
            self.host_base,
            self.extension_base,
            self.config.branch_trampoline_size,
            self.config.local_trampoline_size,
        ) {
            Ok(trampolines) => *self.trampolines.lock() = Some(trampolines),
            Err(e) => {
                tracing::error!(
                    "Couldn't create trampolines: {}. This is fatal, skipping remainder of init",
                    e
                );
                self.sequencer.abort();
            }
        }

        self.sequencer.run_stage(self, Stage::Preload);

        latch.store(BootstrapState::PreinitDone);
        tracing::info!("Preinit complete");
    }

    fn run_init(&self) {
        let latch = self.sequencer.latch();
        if !latch.advance(BootstrapState::PreinitDone, BootstrapState::InitRunning) {
            tracing::trace!("Init already handled ({:?})", latch.get());
            return;
        }

        for stage in Stage::INIT {
            self.sequencer.run_stage(self, stage);
        }

        self.memory.flush_instruction_cache(None);

        latch.store(BootstrapState::InitDone);
        tracing::info!("Init complete");
    }

    // ------------------------------------------------------------------
    // Import hooks
    // ------------------------------------------------------------------

    /// Resolve `module!symbol` in `image` and capture its original pointer
    pub fn prepare_import_hook(
        &self,
        image: &LoadedImage<'_>,
        module: &str,
        symbol: &str,
        replacement: usize,
    ) -> Result<PendingHook, HookError> {
        self.hooks
            .lock()
            .prepare(&*self.memory, image, module, symbol, replacement)
    }

    /// Commit a prepared hook
    pub fn install_hook(&self, pending: PendingHook) -> Result<IatHookKey, HookError> {
        self.hooks.lock().install(&*self.memory, pending)
    }

    /// Prepare and install in one step, returning the key and the original
    pub fn hook_import(
        &self,
        image: &LoadedImage<'_>,
        module: &str,
        symbol: &str,
        replacement: usize,
    ) -> Result<(IatHookKey, usize), HookError> {
        let pending = self.prepare_import_hook(image, module, symbol, replacement)?;
        let original = pending.original();
        let key = self.install_hook(pending)?;
        Ok((key, original))
    }

    pub fn hook_original(&self, key: IatHookKey) -> Option<usize> {
        self.hooks.lock().original(key)
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.lock().len()
    }

    // ------------------------------------------------------------------
    // Trampolines
    // ------------------------------------------------------------------

    /// Run `f` with the trampoline regions, if phase 1 reserved them
    ///
    /// The regions stay locked while `f` runs, so `f` must not call
    /// [`Runtime::with_trampolines`], [`Runtime::write_branch5`] or
    /// [`Runtime::write_call5`]; it patches through the `&mut Trampolines` it
    /// is given, with [`Runtime::memory`] as the target.
    pub fn with_trampolines<R>(&self, f: impl FnOnce(&mut Trampolines) -> R) -> Option<R> {
        self.trampolines.lock().as_mut().map(f)
    }

    /// Patch a 5-byte `jmp` at `src` reaching `dst` through a branch relay
    pub fn write_branch5(&self, src: usize, dst: usize) -> Result<Patch, TrampolineError> {
        self.with_trampolines(|t| t.write_branch5(&*self.memory, src, dst))
            .unwrap_or(Err(TrampolineError::Unavailable))
    }

    /// Patch a 5-byte `call` at `src` reaching `dst` through a branch relay
    pub fn write_call5(&self, src: usize, dst: usize) -> Result<Patch, TrampolineError> {
        self.with_trampolines(|t| t.write_call5(&*self.memory, src, dst))
            .unwrap_or(Err(TrampolineError::Unavailable))
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Class name of a polymorphic host object, or `"<no rtti>"`
    pub fn class_name_of(&self, object: usize) -> String {
        let fallback;
        let relocs = match self.relocations.get() {
            Some(relocs) => relocs,
            None => {
                fallback = RelocationManager::new(self.host_base);
                &fallback
            }
        };
        rtti::class_name_of(&*self.memory, relocs, object)
    }

    /// Runtime address of a named offset from `offsets.json`
    pub fn offset_address(&self, name: &str) -> Result<usize, OffsetsError> {
        let offsets = self
            .offsets
            .as_ref()
            .ok_or_else(|| OffsetsError::NotFound(name.to_string()))?;
        let relocs = self
            .relocations
            .get()
            .copied()
            .unwrap_or_else(|| RelocationManager::new(self.host_base));
        offsets.resolve(name, &relocs)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("host_base", &format_args!("{:#x}", self.host_base))
            .field("extension_base", &format_args!("{:#x}", self.extension_base))
            .field("sequencer", &self.sequencer)
            .field("hooks", &self.hook_count())
            .finish()
    }
}
