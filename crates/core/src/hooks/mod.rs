//! Hook system
//!
//! Import address table hooks, installed once per slot and kept for the
//! lifetime of the process. Branch patches at arbitrary call sites go through
//! [`crate::trampoline::Trampolines`].

pub mod iat;

pub use iat::{HookError, HookInstallation, HookRegistry, IatHookKey, PendingHook};
