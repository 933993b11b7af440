//! Filesystem capability contract.
//!
//! This module defines the interface between a mount provider and the
//! runtime. All operations are async and object-safe; handles are cheap to
//! clone and reference-counted so an in-flight operation can outlive the
//! table slot it was looked up from. The runtime is single-threaded, so
//! nothing here is `Send`.

use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;

/// What a path lookup is allowed to resolve to, and what gets created when
/// creation is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
    /// Either; creation (if requested) produces a file.
    Any,
}

bitflags::bitflags! {
    /// Behavior flags for [`DirHandle::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        /// Create the entry if it does not exist.
        const CREATE = 1 << 0;
        /// Combined with `CREATE`: fail with [`FsError::Exists`] if the
        /// entry is already present.
        const EXCLUSIVE = 1 << 1;
    }
}

/// Kind of an existing directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One entry of a directory enumeration.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

/// Point-in-time view of a file: size, last modification time (milliseconds
/// since the epoch), and the full contents.
#[derive(Debug, Clone, Default)]
pub struct FileSnapshot {
    pub size: u64,
    pub modified_ms: u64,
    pub data: Vec<u8>,
}

/// A resolved node: either a file handle or a directory handle.
#[derive(Clone)]
pub enum Node {
    File(Rc<dyn FileHandle>),
    Dir(Rc<dyn DirHandle>),
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Node::File(_) => f.debug_tuple("File").finish(),
            Node::Dir(_) => f.debug_tuple("Dir").finish(),
        }
    }
}

/// Errors a mount provider can report.
///
/// The runtime maps these to WASI errnos; anything it cannot map aborts the
/// invocation, so providers should prefer the named variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    /// No entry at the given path.
    NotFound,
    /// The provider refused the operation.
    PermissionDenied,
    /// Structural modification rejected (e.g. removing a non-empty
    /// directory).
    InvalidModification,
    /// An entry already exists where exclusive creation was requested.
    Exists,
    /// The operation was aborted by the host.
    Aborted,
    /// Malformed path or argument.
    InvalidArgument,
    /// Anything else; carries the provider's message.
    Other(String),
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "entry not found"),
            FsError::PermissionDenied => write!(f, "permission denied"),
            FsError::InvalidModification => write!(f, "invalid modification"),
            FsError::Exists => write!(f, "entry already exists"),
            FsError::Aborted => write!(f, "operation aborted"),
            FsError::InvalidArgument => write!(f, "invalid argument"),
            FsError::Other(msg) => write!(f, "filesystem error: {}", msg),
        }
    }
}

/// A directory capability.
///
/// `rel_path` arguments are `/`-separated paths relative to this directory.
/// They never contain `.` or `..` components; the runtime resolves those
/// before calling in.
#[async_trait(?Send)]
pub trait DirHandle {
    /// Resolve `rel_path` to a node.
    ///
    /// `kind` selects what to create when `flags` contains
    /// [`OpenFlags::CREATE`] and the entry is absent (`Any` creates a
    /// file). An existing entry is returned as found regardless of `kind`;
    /// type checks are the caller's business.
    async fn open(&self, rel_path: &str, kind: NodeKind, flags: OpenFlags)
        -> Result<Node, FsError>;

    /// Remove the entry at `rel_path`.
    ///
    /// Fails with [`FsError::NotFound`] if absent and
    /// [`FsError::InvalidModification`] for a non-empty directory.
    async fn delete(&self, rel_path: &str) -> Result<(), FsError>;

    /// Enumerate entries starting at the 0-based position `pos`, in a
    /// stable order.
    ///
    /// The enumeration is restartable: calling again with the same `pos`
    /// yields the same remainder (unless the directory changed in
    /// between).
    async fn entries_from(&self, pos: u64) -> Result<Vec<DirEntry>, FsError>;
}

/// A file capability.
#[async_trait(?Send)]
pub trait FileHandle {
    /// Read the current size, modification time and contents.
    async fn snapshot(&self) -> Result<FileSnapshot, FsError>;

    /// Open a write stream. With `keep_existing` false the file is
    /// truncated first.
    async fn writer(&self, keep_existing: bool) -> Result<Box<dyn FileWriter>, FsError>;

    /// Truncate or zero-extend the file to `size` bytes.
    async fn set_size(&self, size: u64) -> Result<(), FsError>;

    /// Commit any provider-side buffering.
    async fn flush(&self) -> Result<(), FsError>;
}

/// A write stream obtained from [`FileHandle::writer`]. Bytes are appended
/// in call order; nothing is visible until [`FileWriter::close`].
#[async_trait(?Send)]
pub trait FileWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), FsError>;

    async fn close(self: Box<Self>) -> Result<(), FsError>;
}
