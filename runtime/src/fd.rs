//! File descriptor table.
//!
//! Maps the guest's fd space onto host capabilities. Fds 0..2 belong to the
//! std streams and normally have no table entry; `fd_renumber` may place an
//! open file there (that is how wasi-libc implements `freopen`), in which
//! case the table entry shadows the stream. Pre-opened mounts occupy fds
//! starting at [`FIRST_PREOPEN_FD`] in insertion order; dynamic fds reuse
//! the lowest free slot above 2.

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use strand_storage::{DirEntry, DirHandle, FileHandle, FileSnapshot, FsError};

use crate::abi::Errno;

/// First fd handed to a pre-opened mount.
pub const FIRST_PREOPEN_FD: u32 = 3;

/// Resolve a `/`-separated guest path to the canonical relative path below
/// a pre-open. Empty and `.` segments vanish; a `..` that would climb out
/// of the mount fails with [`Errno::Notcapable`].
pub fn resolve_path(path: &str) -> Result<String, Errno> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Errno::Notcapable);
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A mount: absolute guest path plus the host directory capability.
#[derive(Clone)]
pub struct PreOpen {
    pub guest_path: String,
    pub handle: Rc<dyn DirHandle>,
}

/// An open regular file.
///
/// The contents cache is loaded lazily from the first snapshot and then
/// serves reads and buffers writes; `dirty` tracks whether the cache has
/// diverged from the host copy. Flushing writes the whole cache back and
/// is idempotent.
pub struct OpenFile {
    pub handle: Rc<dyn FileHandle>,
    pub position: u64,
    contents: Option<Vec<u8>>,
    modified_ms: u64,
    dirty: bool,
}

impl OpenFile {
    /// Wrap a freshly opened host file; contents load on first use.
    pub fn new(handle: Rc<dyn FileHandle>) -> Self {
        OpenFile {
            handle,
            position: 0,
            contents: None,
            modified_ms: 0,
            dirty: false,
        }
    }

    /// Wrap a file known to be empty (created or truncated); no snapshot
    /// round-trip needed.
    pub fn created(handle: Rc<dyn FileHandle>) -> Self {
        OpenFile {
            handle,
            position: 0,
            contents: Some(Vec::new()),
            modified_ms: now_ms(),
            dirty: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.contents.is_some()
    }

    /// Adopt a host snapshot as the cache. A cache that already exists
    /// wins; it may carry unflushed writes.
    pub fn install(&mut self, snapshot: FileSnapshot) {
        if self.contents.is_none() {
            self.contents = Some(snapshot.data);
            self.modified_ms = snapshot.modified_ms;
        }
    }

    pub fn contents(&self) -> Option<&[u8]> {
        self.contents.as_deref()
    }

    pub fn contents_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.contents.as_mut()
    }

    pub fn size(&self) -> Option<u64> {
        self.contents.as_ref().map(|c| c.len() as u64)
    }

    pub fn modified_ms(&self) -> u64 {
        self.modified_ms
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record a cache mutation.
    pub fn touch(&mut self) {
        self.dirty = true;
        self.modified_ms = now_ms();
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

/// An open directory fd.
pub struct OpenDirectory {
    pub handle: Rc<dyn DirHandle>,
}

/// Resumable directory enumeration, positioned by the 64-bit readdir
/// cookie.
pub struct EntryIter {
    entries: VecDeque<DirEntry>,
    pos: u64,
}

impl EntryIter {
    /// Start (or restart) the enumeration at `pos`.
    pub async fn fetch(handle: &dyn DirHandle, pos: u64) -> Result<Self, FsError> {
        Ok(EntryIter {
            entries: handle.entries_from(pos).await?.into(),
            pos,
        })
    }

    /// Position of the entry the next call will yield.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn next_entry(&mut self) -> Option<DirEntry> {
        let entry = self.entries.pop_front();
        if entry.is_some() {
            self.pos += 1;
        }
        entry
    }

    /// Push one entry back so the next call re-yields it. Used when the
    /// guest's readdir buffer cannot hold the entry.
    pub fn revert(&mut self, entry: DirEntry) {
        self.entries.push_front(entry);
        self.pos -= 1;
    }
}

/// What an fd resolves to.
pub enum FdEntry {
    PreOpen(PreOpen),
    File(OpenFile),
    Dir(OpenDirectory),
}

/// The per-instance fd table.
pub struct FdTable {
    entries: BTreeMap<u32, FdEntry>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            entries: BTreeMap::new(),
        }
    }

    /// Register a mount. Pre-opens are installed once, before the guest
    /// starts, and occupy consecutive fds from [`FIRST_PREOPEN_FD`].
    pub fn push_preopen(&mut self, preopen: PreOpen) -> u32 {
        self.insert(FdEntry::PreOpen(preopen))
    }

    /// Allocate the lowest free fd above the std streams.
    pub fn insert(&mut self, entry: FdEntry) -> u32 {
        let mut fd = FIRST_PREOPEN_FD;
        while self.entries.contains_key(&fd) {
            fd += 1;
        }
        self.entries.insert(fd, entry);
        fd
    }

    pub fn insert_at(&mut self, fd: u32, entry: FdEntry) {
        self.entries.insert(fd, entry);
    }

    pub fn contains(&self, fd: u32) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn get(&self, fd: u32) -> Result<&FdEntry, Errno> {
        self.entries.get(&fd).ok_or(Errno::Badf)
    }

    pub fn get_mut(&mut self, fd: u32) -> Result<&mut FdEntry, Errno> {
        self.entries.get_mut(&fd).ok_or(Errno::Badf)
    }

    pub fn get_preopen(&self, fd: u32) -> Result<&PreOpen, Errno> {
        match self.get(fd)? {
            FdEntry::PreOpen(preopen) => Ok(preopen),
            _ => Err(Errno::Badf),
        }
    }

    pub fn get_file_mut(&mut self, fd: u32) -> Result<&mut OpenFile, Errno> {
        match self.get_mut(fd)? {
            FdEntry::File(file) => Ok(file),
            _ => Err(Errno::Badf),
        }
    }

    pub fn remove(&mut self, fd: u32) -> Option<FdEntry> {
        self.entries.remove(&fd)
    }

    /// Move the entry at `from` to `to`. The caller is responsible for
    /// closing whatever occupied `to` first.
    pub fn renumber(&mut self, from: u32, to: u32) -> Result<(), Errno> {
        let entry = self.entries.remove(&from).ok_or(Errno::Badf)?;
        self.entries.insert(to, entry);
        Ok(())
    }

    /// Locate the pre-open whose guest path is the longest whole-segment
    /// prefix of `abs_path`, and the path relative to it.
    pub fn find_rel_path(&self, abs_path: &str) -> Result<(u32, String), Errno> {
        let mut best: Option<(u32, usize, String)> = None;
        for (fd, entry) in &self.entries {
            let preopen = match entry {
                FdEntry::PreOpen(preopen) => preopen,
                _ => continue,
            };
            if let Some(rel) = prefix_match(&preopen.guest_path, abs_path) {
                let len = preopen.guest_path.len();
                if best.as_ref().map_or(true, |(_, best_len, _)| len > *best_len) {
                    best = Some((*fd, len, rel));
                }
            }
        }
        best.map(|(fd, _, rel)| (fd, rel)).ok_or(Errno::Noent)
    }

    /// Take the write-back set: handle plus cache contents of every dirty
    /// file, leaving the files clean.
    pub fn take_dirty_files(&mut self) -> Vec<(Rc<dyn FileHandle>, Vec<u8>)> {
        let mut out = Vec::new();
        for entry in self.entries.values_mut() {
            if let FdEntry::File(file) = entry {
                if file.is_dirty() {
                    if let Some(contents) = file.contents() {
                        out.push((Rc::clone(&file.handle), contents.to_vec()));
                    }
                    file.mark_clean();
                }
            }
        }
        out
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whole-segment prefix match: `/sandbox` matches `/sandbox/x` and itself,
/// never `/sandbox2`.
fn prefix_match(pre: &str, abs: &str) -> Option<String> {
    if abs == pre {
        return Some(String::new());
    }
    if pre == "/" {
        return abs.strip_prefix('/').map(String::from);
    }
    abs.strip_prefix(pre)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(String::from)
}

// ─── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use strand_storage::MemDirectory;

    fn mount(path: &str) -> PreOpen {
        PreOpen {
            guest_path: path.to_string(),
            handle: Rc::new(MemDirectory::new()),
        }
    }

    #[test]
    fn resolve_rejects_escapes() {
        assert_eq!(resolve_path("input.txt").unwrap(), "input.txt");
        assert_eq!(resolve_path("./a//b/./c").unwrap(), "a/b/c");
        assert_eq!(resolve_path("a/../b").unwrap(), "b");
        assert_eq!(resolve_path("a/b/../..").unwrap(), "");
        assert_eq!(resolve_path(".."), Err(Errno::Notcapable));
        assert_eq!(resolve_path("a/../../b"), Err(Errno::Notcapable));
    }

    #[test]
    fn preopens_start_at_three() {
        let mut table = FdTable::new();
        assert_eq!(table.push_preopen(mount("/sandbox")), 3);
        assert_eq!(table.push_preopen(mount("/tmp")), 4);
    }

    #[test]
    fn allocation_reuses_lowest_free() {
        let mut table = FdTable::new();
        table.push_preopen(mount("/sandbox"));
        let a = table.insert(FdEntry::Dir(OpenDirectory {
            handle: Rc::new(MemDirectory::new()),
        }));
        let b = table.insert(FdEntry::Dir(OpenDirectory {
            handle: Rc::new(MemDirectory::new()),
        }));
        assert_eq!((a, b), (4, 5));
        table.remove(a);
        let c = table.insert(FdEntry::Dir(OpenDirectory {
            handle: Rc::new(MemDirectory::new()),
        }));
        assert_eq!(c, 4);
    }

    #[test]
    fn renumber_moves_entries() {
        let mut table = FdTable::new();
        let fd = table.insert(FdEntry::Dir(OpenDirectory {
            handle: Rc::new(MemDirectory::new()),
        }));
        table.renumber(fd, 0).unwrap();
        assert!(table.contains(0));
        assert!(!table.contains(fd));
        assert_eq!(table.renumber(99, 0), Err(Errno::Badf));
    }

    #[test]
    fn longest_whole_segment_prefix_wins() {
        let mut table = FdTable::new();
        table.push_preopen(mount("/sandbox"));
        table.push_preopen(mount("/sandbox/deep"));
        table.push_preopen(mount("/tmp"));

        let (fd, rel) = table.find_rel_path("/sandbox/deep/a.txt").unwrap();
        assert_eq!((fd, rel.as_str()), (4, "a.txt"));

        let (fd, rel) = table.find_rel_path("/sandbox/a.txt").unwrap();
        assert_eq!((fd, rel.as_str()), (3, "a.txt"));

        // Same fd for the mount root itself.
        let (fd, rel) = table.find_rel_path("/tmp").unwrap();
        assert_eq!((fd, rel.as_str()), (5, ""));

        // Segment boundaries: /sandbox2 is not under /sandbox.
        assert_eq!(table.find_rel_path("/sandbox2/a.txt"), Err(Errno::Noent));
        assert_eq!(table.find_rel_path("/etc/passwd"), Err(Errno::Noent));
    }

    #[test]
    fn entry_iter_reverts() {
        let dir = MemDirectory::new();
        dir.create_file("a.txt", b"a").unwrap();
        dir.create_file("b.txt", b"b").unwrap();

        let mut iter = block_on(EntryIter::fetch(&dir, 0)).unwrap();
        let first = iter.next_entry().unwrap();
        assert_eq!(first.name, "a.txt");
        assert_eq!(iter.position(), 1);

        iter.revert(first);
        assert_eq!(iter.position(), 0);
        assert_eq!(iter.next_entry().unwrap().name, "a.txt");
        assert_eq!(iter.next_entry().unwrap().name, "b.txt");
        assert!(iter.next_entry().is_none());

        // Restart mid-way via a fresh fetch, as a new cookie would.
        let mut iter = block_on(EntryIter::fetch(&dir, 1)).unwrap();
        assert_eq!(iter.next_entry().unwrap().name, "b.txt");
    }

    #[test]
    fn open_file_cache_lifecycle() {
        let dir = MemDirectory::new();
        dir.create_file("f.txt", b"hello").unwrap();
        let node = block_on(dir.open(
            "f.txt",
            strand_storage::NodeKind::Any,
            strand_storage::OpenFlags::empty(),
        ))
        .unwrap();
        let handle = match node {
            strand_storage::Node::File(handle) => handle,
            _ => panic!("expected a file"),
        };

        let mut file = OpenFile::new(Rc::clone(&handle));
        assert!(!file.is_loaded());
        file.install(block_on(handle.snapshot()).unwrap());
        assert_eq!(file.contents().unwrap(), b"hello");
        assert!(!file.is_dirty());

        file.contents_mut().unwrap().extend_from_slice(b"!");
        file.touch();
        assert!(file.is_dirty());
        assert_eq!(file.size(), Some(6));

        // A second install must not clobber unflushed writes.
        file.install(FileSnapshot::default());
        assert_eq!(file.contents().unwrap(), b"hello!");
    }
}
