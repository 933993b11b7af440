//! Strand WASM runtime.
//!
//! This crate runs WebAssembly guests compiled against the WASI
//! `snapshot_preview1` ABI on top of an asynchronous host filesystem. The
//! host never blocks: every WASI call that touches storage or the clock is
//! turned into a cooperative await point by unwinding and rewinding the
//! guest through the asyncify hooks baked into the module.
//!
//! # Architecture
//!
//! - `abi`: WASI struct layouts, errno taxonomy, flag sets
//! - `memory`: bounds-checked little-endian view of guest linear memory
//! - `fd`: pre-opens, file descriptor table, path resolution
//! - `streams`: stdin/stdout/stderr abstractions
//! - `asyncify`: the unwind/rewind controller and import trampoline
//! - `wasi`: the `wasi_snapshot_preview1` binding surface
//! - `launcher`: invocation assembly, run mode and export mode

use std::fmt;

pub mod abi;
pub mod asyncify;
pub mod fd;
pub mod launcher;
pub mod memory;
pub mod streams;
pub mod wasi;

pub use launcher::{run, GuestHandle, Invocation};

/// Runtime error types.
#[derive(Debug, Clone)]
pub enum RuntimeError {
    /// Failed to parse or validate the guest module.
    InvalidModule(String),
    /// Failed to instantiate the module or link its imports.
    Instantiation(String),
    /// The guest lacks a required export.
    MissingExport(String),
    /// The guest trapped or execution failed inside the engine.
    Wasm(String),
    /// The guest called `proc_exit`; carries the exit code. Only the
    /// driver observes this, the guest never sees it as an errno.
    Exit(u32),
    /// Host-side programming error; aborts the whole invocation.
    Fault(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvalidModule(msg) => write!(f, "invalid module: {}", msg),
            RuntimeError::Instantiation(msg) => write!(f, "instantiation failed: {}", msg),
            RuntimeError::MissingExport(name) => write!(f, "missing export: {}", name),
            RuntimeError::Wasm(msg) => write!(f, "execution failed: {}", msg),
            RuntimeError::Exit(code) => write!(f, "guest exited with status {}", code),
            RuntimeError::Fault(msg) => write!(f, "host fault: {}", msg),
        }
    }
}

/// Raised by `proc_exit`; unwinds the engine as a host error and is caught
/// by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(pub u32);

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

impl wasmi::core::HostError for ExitStatus {}

/// A host programming error surfaced from inside a WASI call. Unlike a
/// [`abi::Errno`] it is never shown to the guest; it aborts the invocation.
#[derive(Debug, Clone)]
pub struct HostFault(pub String);

impl fmt::Display for HostFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host fault: {}", self.0)
    }
}

impl wasmi::core::HostError for HostFault {}
