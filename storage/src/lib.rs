//! Host filesystem layer for the strand runtime.
//!
//! The runtime never touches a concrete filesystem. Instead it consumes the
//! capability contract defined in [`vfs`]: a mount is an async directory
//! handle, files are async file handles, and every operation that could hit
//! real storage returns a future. The runtime decides how those futures are
//! awaited (through the asyncify trampoline); this crate only describes what
//! a mount can do.
//!
//! [`memfs`] ships the in-memory implementation used by tests and examples.
//! It completes every operation on the first poll unless forced-async mode
//! is enabled, in which case each operation yields once so callers exercise
//! their suspension paths.

pub mod memfs;
pub mod vfs;

pub use memfs::{MemDirectory, MemFile};
pub use vfs::{
    DirEntry, DirHandle, EntryKind, FileHandle, FileSnapshot, FileWriter, FsError, Node, NodeKind,
    OpenFlags,
};
