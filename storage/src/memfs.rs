//! In-memory filesystem.
//!
//! A tree of reference-counted nodes implementing the [`vfs`](crate::vfs)
//! contract. Used as the mount provider in tests and examples.
//!
//! Every operation completes on its first poll by default. With forced-async
//! mode enabled ([`MemDirectory::set_forced_async`]) each operation yields to
//! the executor once before doing its work, so a caller that special-cases
//! "finished immediately" is pushed through its suspension path as well.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::vfs::{
    DirEntry, DirHandle, EntryKind, FileHandle, FileSnapshot, FileWriter, FsError, Node, NodeKind,
    OpenFlags,
};

/// Tree-wide knobs, shared by every handle spawned from the same root.
#[derive(Default)]
struct Settings {
    forced_async: Cell<bool>,
}

impl Settings {
    async fn pause(&self) {
        if self.forced_async.get() {
            tokio::task::yield_now().await;
        }
    }
}

struct FileNode {
    data: RefCell<Vec<u8>>,
    modified_ms: Cell<u64>,
}

impl FileNode {
    fn new(data: Vec<u8>) -> Rc<Self> {
        Rc::new(FileNode {
            data: RefCell::new(data),
            modified_ms: Cell::new(now_ms()),
        })
    }

    fn touch(&self) {
        self.modified_ms.set(now_ms());
    }
}

struct DirNode {
    entries: RefCell<BTreeMap<String, MemNode>>,
}

impl DirNode {
    fn new() -> Rc<Self> {
        Rc::new(DirNode {
            entries: RefCell::new(BTreeMap::new()),
        })
    }
}

#[derive(Clone)]
enum MemNode {
    File(Rc<FileNode>),
    Dir(Rc<DirNode>),
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A directory of the in-memory tree. The root doubles as the builder used
/// to seed fixtures before an invocation starts.
#[derive(Clone)]
pub struct MemDirectory {
    node: Rc<DirNode>,
    settings: Rc<Settings>,
}

impl MemDirectory {
    /// Create an empty directory tree.
    pub fn new() -> Self {
        MemDirectory {
            node: DirNode::new(),
            settings: Rc::new(Settings::default()),
        }
    }

    /// Make every subsequent operation on this tree yield once before
    /// completing.
    pub fn set_forced_async(&self, enabled: bool) {
        self.settings.forced_async.set(enabled);
    }

    /// Seed a file under this directory. The parent directory must already
    /// exist. Overwrites an existing file.
    pub fn create_file(&self, rel_path: &str, data: &[u8]) -> Result<(), FsError> {
        let (dir, name) = self.walk_parent(rel_path)?;
        dir.entries
            .borrow_mut()
            .insert(name, MemNode::File(FileNode::new(data.to_vec())));
        Ok(())
    }

    /// Seed a subdirectory. The parent directory must already exist.
    pub fn create_dir(&self, rel_path: &str) -> Result<(), FsError> {
        let (dir, name) = self.walk_parent(rel_path)?;
        let mut entries = dir.entries.borrow_mut();
        if entries.contains_key(&name) {
            return Err(FsError::Exists);
        }
        entries.insert(name, MemNode::Dir(DirNode::new()));
        Ok(())
    }

    /// Read a file's current contents, for test assertions.
    pub fn read(&self, rel_path: &str) -> Option<Vec<u8>> {
        let (dir, name) = self.walk_parent(rel_path).ok()?;
        let result = match dir.entries.borrow().get(&name)? {
            MemNode::File(file) => Some(file.data.borrow().clone()),
            MemNode::Dir(_) => None,
        };
        result
    }

    fn wrap_dir(&self, node: Rc<DirNode>) -> MemDirectory {
        MemDirectory {
            node,
            settings: Rc::clone(&self.settings),
        }
    }

    fn wrap_file(&self, node: Rc<FileNode>) -> MemFile {
        MemFile {
            node,
            settings: Rc::clone(&self.settings),
        }
    }

    /// Walk all but the last segment of `rel_path`; returns the parent
    /// directory node and the final segment.
    fn walk_parent(&self, rel_path: &str) -> Result<(Rc<DirNode>, String), FsError> {
        let mut segments: Vec<&str> = rel_path.split('/').filter(|s| !s.is_empty()).collect();
        let name = match segments.pop() {
            Some(name) => name.to_string(),
            None => return Err(FsError::InvalidArgument),
        };
        let mut current = Rc::clone(&self.node);
        for segment in segments {
            let next = match current.entries.borrow().get(segment) {
                Some(MemNode::Dir(dir)) => Rc::clone(dir),
                Some(MemNode::File(_)) | None => return Err(FsError::NotFound),
            };
            current = next;
        }
        Ok((current, name))
    }
}

impl Default for MemDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl DirHandle for MemDirectory {
    async fn open(
        &self,
        rel_path: &str,
        kind: NodeKind,
        flags: OpenFlags,
    ) -> Result<Node, FsError> {
        self.settings.pause().await;

        // The empty path names this directory itself.
        if rel_path.split('/').all(|s| s.is_empty()) {
            return Ok(Node::Dir(Rc::new(self.clone())));
        }

        let (parent, name) = self.walk_parent(rel_path)?;
        let mut entries = parent.entries.borrow_mut();
        if let Some(existing) = entries.get(&name) {
            if flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
                return Err(FsError::Exists);
            }
            return Ok(match existing {
                MemNode::File(file) => Node::File(Rc::new(self.wrap_file(Rc::clone(file)))),
                MemNode::Dir(dir) => Node::Dir(Rc::new(self.wrap_dir(Rc::clone(dir)))),
            });
        }
        if !flags.contains(OpenFlags::CREATE) {
            return Err(FsError::NotFound);
        }
        match kind {
            NodeKind::Dir => {
                let dir = DirNode::new();
                entries.insert(name, MemNode::Dir(Rc::clone(&dir)));
                Ok(Node::Dir(Rc::new(self.wrap_dir(dir))))
            }
            NodeKind::File | NodeKind::Any => {
                let file = FileNode::new(Vec::new());
                entries.insert(name, MemNode::File(Rc::clone(&file)));
                Ok(Node::File(Rc::new(self.wrap_file(file))))
            }
        }
    }

    async fn delete(&self, rel_path: &str) -> Result<(), FsError> {
        self.settings.pause().await;
        let (parent, name) = self.walk_parent(rel_path)?;
        let mut entries = parent.entries.borrow_mut();
        match entries.get(&name) {
            None => return Err(FsError::NotFound),
            Some(MemNode::Dir(dir)) if !dir.entries.borrow().is_empty() => {
                return Err(FsError::InvalidModification);
            }
            Some(_) => {}
        }
        entries.remove(&name);
        Ok(())
    }

    async fn entries_from(&self, pos: u64) -> Result<Vec<DirEntry>, FsError> {
        self.settings.pause().await;
        Ok(self
            .node
            .entries
            .borrow()
            .iter()
            .skip(pos as usize)
            .map(|(name, node)| DirEntry {
                name: name.clone(),
                kind: match node {
                    MemNode::File(_) => EntryKind::File,
                    MemNode::Dir(_) => EntryKind::Directory,
                },
            })
            .collect())
    }
}

/// A file of the in-memory tree.
#[derive(Clone)]
pub struct MemFile {
    node: Rc<FileNode>,
    settings: Rc<Settings>,
}

#[async_trait(?Send)]
impl FileHandle for MemFile {
    async fn snapshot(&self) -> Result<FileSnapshot, FsError> {
        self.settings.pause().await;
        let data = self.node.data.borrow().clone();
        Ok(FileSnapshot {
            size: data.len() as u64,
            modified_ms: self.node.modified_ms.get(),
            data,
        })
    }

    async fn writer(&self, keep_existing: bool) -> Result<Box<dyn FileWriter>, FsError> {
        self.settings.pause().await;
        let buf = if keep_existing {
            self.node.data.borrow().clone()
        } else {
            Vec::new()
        };
        Ok(Box::new(MemWriter {
            node: Rc::clone(&self.node),
            settings: Rc::clone(&self.settings),
            buf,
        }))
    }

    async fn set_size(&self, size: u64) -> Result<(), FsError> {
        self.settings.pause().await;
        self.node.data.borrow_mut().resize(size as usize, 0);
        self.node.touch();
        Ok(())
    }

    async fn flush(&self) -> Result<(), FsError> {
        self.settings.pause().await;
        Ok(())
    }
}

struct MemWriter {
    node: Rc<FileNode>,
    settings: Rc<Settings>,
    buf: Vec<u8>,
}

#[async_trait(?Send)]
impl FileWriter for MemWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), FsError> {
        self.settings.pause().await;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), FsError> {
        self.settings.pause().await;
        *self.node.data.borrow_mut() = self.buf;
        self.node.touch();
        Ok(())
    }
}

// ─── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn fixture() -> MemDirectory {
        let root = MemDirectory::new();
        root.create_dir("sub").unwrap();
        root.create_file("hello.txt", b"hello").unwrap();
        root.create_file("sub/nested.txt", b"nested").unwrap();
        root
    }

    #[test]
    fn open_existing_file() {
        let root = fixture();
        let node = block_on(root.open("hello.txt", NodeKind::Any, OpenFlags::empty())).unwrap();
        match node {
            Node::File(file) => {
                let snap = block_on(file.snapshot()).unwrap();
                assert_eq!(snap.data, b"hello");
                assert_eq!(snap.size, 5);
            }
            Node::Dir(_) => panic!("expected a file"),
        }
    }

    #[test]
    fn open_missing_without_create() {
        let root = fixture();
        let err = block_on(root.open("absent.txt", NodeKind::Any, OpenFlags::empty())).unwrap_err();
        assert_eq!(err, FsError::NotFound);
    }

    #[test]
    fn create_and_exclusive() {
        let root = fixture();
        block_on(root.open("new.txt", NodeKind::File, OpenFlags::CREATE)).unwrap();
        let err = block_on(root.open(
            "new.txt",
            NodeKind::File,
            OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
        ))
        .unwrap_err();
        assert_eq!(err, FsError::Exists);
    }

    #[test]
    fn nested_lookup() {
        let root = fixture();
        let node =
            block_on(root.open("sub/nested.txt", NodeKind::Any, OpenFlags::empty())).unwrap();
        match node {
            Node::File(file) => {
                assert_eq!(block_on(file.snapshot()).unwrap().data, b"nested");
            }
            Node::Dir(_) => panic!("expected a file"),
        }
    }

    #[test]
    fn delete_missing_and_nonempty() {
        let root = fixture();
        assert_eq!(block_on(root.delete("absent")), Err(FsError::NotFound));
        assert_eq!(
            block_on(root.delete("sub")),
            Err(FsError::InvalidModification)
        );
        block_on(root.delete("sub/nested.txt")).unwrap();
        block_on(root.delete("sub")).unwrap();
    }

    #[test]
    fn enumeration_is_stable_and_restartable() {
        let root = fixture();
        let all = block_on(root.entries_from(0)).unwrap();
        let names: Vec<&str> = all.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["hello.txt", "sub"]);

        let rest = block_on(root.entries_from(1)).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "sub");
        assert_eq!(rest[0].kind, EntryKind::Directory);
    }

    #[test]
    fn writer_replaces_contents() {
        let root = fixture();
        let node = block_on(root.open("hello.txt", NodeKind::Any, OpenFlags::empty())).unwrap();
        let file = match node {
            Node::File(file) => file,
            Node::Dir(_) => panic!("expected a file"),
        };
        let mut writer = block_on(file.writer(false)).unwrap();
        block_on(writer.write(b"re")).unwrap();
        block_on(writer.write(b"placed")).unwrap();
        block_on(writer.close()).unwrap();
        assert_eq!(root.read("hello.txt").unwrap(), b"replaced");
    }

    #[test]
    fn set_size_truncates_and_extends() {
        let root = fixture();
        let node = block_on(root.open("hello.txt", NodeKind::Any, OpenFlags::empty())).unwrap();
        let file = match node {
            Node::File(file) => file,
            Node::Dir(_) => panic!("expected a file"),
        };
        block_on(file.set_size(2)).unwrap();
        assert_eq!(root.read("hello.txt").unwrap(), b"he");
        block_on(file.set_size(4)).unwrap();
        assert_eq!(root.read("hello.txt").unwrap(), b"he\0\0");
    }
}
