//! Read-only file-node layer.
//!
//! The driver manager consumes a deliberately narrow contract: a node has a
//! name, a path, a kind, and supports positional reads plus child
//! iteration. Nothing in the core mutates the filesystem. The only
//! implementation here is [`RamFs`], an in-memory tree fed from the boot
//! archive; richer filesystems stay behind the same trait.

#![no_std]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod ramfs;

pub use ramfs::RamFs;

use alloc::sync::Arc;
use alloc::vec::Vec;

/// Filesystem errors surfaced through the node contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path does not resolve to a node.
    NotFound,
    /// A path component resolved to a non-directory.
    NotADirectory,
    /// Node exists already.
    AlreadyExists,
    /// A byte quota would be exceeded.
    QuotaExceeded,
    /// Operation requires a regular file.
    NotARegularFile,
}

/// What a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    RegularFile,
    Directory,
}

/// The read-only contract consumed by the driver manager.
pub trait FileNode: Send + Sync {
    /// Final path component.
    fn name(&self) -> &str;

    /// Full path from the filesystem root.
    fn path(&self) -> &str;

    fn kind(&self) -> NodeKind;

    /// Size in bytes (0 for directories).
    fn size(&self) -> usize;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; 0 at or past end of file.
    fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize, FsError>;

    /// Child nodes, in insertion order. Empty for regular files.
    fn children(&self) -> Vec<Arc<dyn FileNode>>;

    /// Convenience: is this a regular file?
    fn is_regular_file(&self) -> bool {
        self.kind() == NodeKind::RegularFile
    }
}

/// Read a node's entire contents.
pub fn read_all(node: &dyn FileNode) -> Result<Vec<u8>, FsError> {
    if !node.is_regular_file() {
        return Err(FsError::NotARegularFile);
    }
    let mut out = alloc::vec![0u8; node.size()];
    let mut done = 0;
    while done < out.len() {
        let n = node.read(&mut out[done..], done)?;
        if n == 0 {
            break;
        }
        done += n;
    }
    out.truncate(done);
    Ok(out)
}
