//! In-memory filesystem.
//!
//! Holds the boot archive contents (driver images, the init binary) as an
//! immutable-after-build tree. A global byte quota bounds how much of the
//! kernel heap the archive may pin.

use crate::{FileNode, FsError, NodeKind};
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::RwLock;

/// Maximum total bytes across all ramfs instances.
const MAX_TOTAL_BYTES: usize = 64 * 1024 * 1024;

/// Total bytes pinned by ramfs file contents.
static TOTAL_BYTES_USED: AtomicUsize = AtomicUsize::new(0);

/// Reserve `bytes` from the global quota.
fn quota_try_alloc(bytes: usize) -> bool {
    let mut current = TOTAL_BYTES_USED.load(Ordering::SeqCst);
    loop {
        let new_total = match current.checked_add(bytes) {
            Some(t) if t <= MAX_TOTAL_BYTES => t,
            _ => return false,
        };
        match TOTAL_BYTES_USED.compare_exchange_weak(
            current,
            new_total,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Return `bytes` to the global quota.
fn quota_release(bytes: usize) {
    let _ = TOTAL_BYTES_USED.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
        Some(current.saturating_sub(bytes))
    });
}

/// One ramfs node.
struct RamNode {
    name: String,
    path: String,
    kind: NodeKind,
    data: Vec<u8>,
    children: RwLock<Vec<Arc<RamNode>>>,
}

impl Drop for RamNode {
    fn drop(&mut self) {
        if self.kind == NodeKind::RegularFile {
            quota_release(self.data.len());
        }
    }
}

impl FileNode for RamNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        if self.kind != NodeKind::RegularFile {
            return Err(FsError::NotARegularFile);
        }
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }

    fn children(&self) -> Vec<Arc<dyn FileNode>> {
        self.children
            .read()
            .iter()
            .map(|c| c.clone() as Arc<dyn FileNode>)
            .collect()
    }
}

/// An in-memory filesystem rooted at `/`.
pub struct RamFs {
    root: Arc<RamNode>,
}

impl RamFs {
    pub fn new() -> Self {
        RamFs {
            root: Arc::new(RamNode {
                name: String::from("/"),
                path: String::from("/"),
                kind: NodeKind::Directory,
                data: Vec::new(),
                children: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Insert a regular file, creating intermediate directories.
    pub fn add_file(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let (file_name, dirs) = match components.split_last() {
            Some(v) => v,
            None => return Err(FsError::AlreadyExists), // "/" itself
        };

        if !quota_try_alloc(content.len()) {
            klog!(Warn, "ramfs: quota exceeded adding {} ({} bytes)", path, content.len());
            return Err(FsError::QuotaExceeded);
        }

        let mut cursor = self.root.clone();
        for dir in dirs {
            match Self::child_dir(&cursor, dir) {
                Ok(next) => cursor = next,
                Err(e) => {
                    quota_release(content.len());
                    return Err(e);
                }
            }
        }

        let mut children = cursor.children.write();
        if children.iter().any(|c| c.name == *file_name) {
            quota_release(content.len());
            return Err(FsError::AlreadyExists);
        }
        children.push(Arc::new(RamNode {
            name: (*file_name).to_string(),
            path: normalize(path),
            kind: NodeKind::RegularFile,
            data: content.to_vec(),
            children: RwLock::new(Vec::new()),
        }));
        Ok(())
    }

    /// Find or create the child directory `name` of `parent`.
    fn child_dir(parent: &Arc<RamNode>, name: &str) -> Result<Arc<RamNode>, FsError> {
        {
            let children = parent.children.read();
            if let Some(existing) = children.iter().find(|c| c.name == name) {
                return match existing.kind {
                    NodeKind::Directory => Ok(existing.clone()),
                    NodeKind::RegularFile => Err(FsError::NotADirectory),
                };
            }
        }
        let mut children = parent.children.write();
        // Re-check under the write lock.
        if let Some(existing) = children.iter().find(|c| c.name == name) {
            return match existing.kind {
                NodeKind::Directory => Ok(existing.clone()),
                NodeKind::RegularFile => Err(FsError::NotADirectory),
            };
        }
        let path = if parent.path == "/" {
            alloc::format!("/{}", name)
        } else {
            alloc::format!("{}/{}", parent.path, name)
        };
        let dir = Arc::new(RamNode {
            name: name.to_string(),
            path,
            kind: NodeKind::Directory,
            data: Vec::new(),
            children: RwLock::new(Vec::new()),
        });
        children.push(dir.clone());
        Ok(dir)
    }

    /// Resolve a path to a node.
    pub fn get_by_path(&self, path: &str) -> Option<Arc<dyn FileNode>> {
        let mut cursor = self.root.clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let next = {
                let children = cursor.children.read();
                children.iter().find(|c| c.name == component).cloned()?
            };
            cursor = next;
        }
        Some(cursor as Arc<dyn FileNode>)
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(path: &str) -> String {
    let mut out = String::from("/");
    let mut first = true;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if !first {
            out.push('/');
        }
        out.push_str(component);
        first = false;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_read() {
        let fs = RamFs::new();
        fs.add_file("/boot/drivers/null.drv", b"hello").unwrap();

        let node = fs.get_by_path("/boot/drivers/null.drv").expect("resolve");
        assert!(node.is_regular_file());
        assert_eq!(node.name(), "null.drv");
        assert_eq!(node.path(), "/boot/drivers/null.drv");
        assert_eq!(node.size(), 5);

        let mut buf = [0u8; 16];
        let n = node.read(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"hello");

        // Positional read past EOF.
        assert_eq!(node.read(&mut buf, 5).unwrap(), 0);
        // Partial read.
        let n = node.read(&mut buf[..2], 1).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"el");
    }

    #[test]
    fn test_directory_listing_order() {
        let fs = RamFs::new();
        fs.add_file("/drv/a.drv", b"a").unwrap();
        fs.add_file("/drv/b.drv", b"b").unwrap();
        fs.add_file("/drv/c.drv", b"c").unwrap();

        let dir = fs.get_by_path("/drv").expect("dir");
        assert_eq!(dir.kind(), NodeKind::Directory);
        let names: Vec<_> = dir.children().iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, ["a.drv", "b.drv", "c.drv"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let fs = RamFs::new();
        fs.add_file("/x", b"1").unwrap();
        assert_eq!(fs.add_file("/x", b"2"), Err(FsError::AlreadyExists));
    }

    #[test]
    fn test_file_as_directory_rejected() {
        let fs = RamFs::new();
        fs.add_file("/file", b"data").unwrap();
        assert_eq!(fs.add_file("/file/child", b"x"), Err(FsError::NotADirectory));
    }

    #[test]
    fn test_read_all_helper() {
        let fs = RamFs::new();
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        fs.add_file("/big", &payload).unwrap();
        let node = fs.get_by_path("/big").unwrap();
        assert_eq!(crate::read_all(node.as_ref()).unwrap(), payload);
    }
}
