//! Virtual filesystem abstraction for the archive builder
//!
//! The builder walks a [`FileSystem`] rather than the OS directly so archives
//! can be built from real directories ([`DirFs`]) or in-memory trees
//! ([`MemFs`], used throughout the tests). Walks are deterministic: entries
//! come back sorted by path, metadata is lstat-style and never follows links.

use crate::error::{Result, SarError};
use crate::sar::toc::EntryKind;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// One walked entry, in archive order
#[derive(Debug, Clone)]
pub struct VfsEntry {
    /// Relative POSIX-style path
    pub path: String,
    pub kind: EntryKind,
    /// Logical size in bytes; zero for non-files
    pub size: u64,
    /// Permission and type bits
    pub mode: u32,
    /// Symlink target, filled by the walk for symlink entries
    pub link_target: Option<String>,
}

/// Source tree the builder consumes
pub trait FileSystem: Send + Sync {
    /// Walk the tree in deterministic sorted order
    fn walk(&self) -> Result<Vec<VfsEntry>>;

    /// Open a regular file for streaming
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send + '_>>;
}

/// A directory on the local filesystem
pub struct DirFs {
    root: PathBuf,
}

impl DirFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSystem for DirFs {
    fn walk(&self) -> Result<Vec<VfsEntry>> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let mut entries = Vec::new();
        for item in walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
        {
            let item = item.map_err(|e| SarError::Io(format!("walk failed: {}", e)))?;
            if item.path() == self.root {
                continue;
            }
            let rel = item
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| SarError::Io(format!("walk produced foreign path: {}", e)))?;
            let name = rel
                .to_str()
                .ok_or_else(|| {
                    SarError::InvalidSource(format!("non-UTF-8 path: {}", rel.display()))
                })?
                .replace('\\', "/");

            // lstat semantics: walkdir with follow_links(false) reports the
            // link itself.
            let meta = item
                .metadata()
                .map_err(|e| SarError::Io(format!("lstat {} failed: {}", name, e)))?;
            let file_type = meta.file_type();

            let (kind, size, link_target) = if file_type.is_dir() {
                (EntryKind::Directory, 0, None)
            } else if file_type.is_file() {
                (EntryKind::Regular, meta.len(), None)
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(item.path())
                    .map_err(|e| {
                        SarError::InvalidSource(format!("readlink {} failed: {}", name, e))
                    })?
                    .to_str()
                    .ok_or_else(|| {
                        SarError::InvalidSource(format!("non-UTF-8 link target in {}", name))
                    })?
                    .to_string();
                (EntryKind::Symlink, 0, Some(target))
            } else if file_type.is_fifo() {
                (EntryKind::Fifo, 0, None)
            } else if file_type.is_char_device() {
                (EntryKind::CharDevice, 0, None)
            } else if file_type.is_block_device() {
                (EntryKind::BlockDevice, 0, None)
            } else {
                return Err(SarError::InvalidSource(format!(
                    "unsupported file type at {}",
                    name
                )));
            };

            entries.push(VfsEntry {
                path: name,
                kind,
                size,
                mode: meta.mode(),
                link_target,
            });
        }
        Ok(entries)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send + '_>> {
        let full = self.root.join(path);
        let file = std::fs::File::open(&full)
            .map_err(|e| SarError::Io(format!("open {} failed: {}", full.display(), e)))?;
        Ok(Box::new(file))
    }
}

/// In-memory tree node
#[derive(Debug, Clone)]
enum MemNode {
    File { content: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
    Symlink { target: String },
}

/// In-memory filesystem for tests and programmatic archive construction
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    nodes: BTreeMap<String, MemNode>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, path: &str, content: impl Into<Vec<u8>>, mode: u32) -> &mut Self {
        self.nodes.insert(
            path.to_string(),
            MemNode::File {
                content: content.into(),
                mode,
            },
        );
        self
    }

    pub fn add_dir(&mut self, path: &str, mode: u32) -> &mut Self {
        self.nodes.insert(path.to_string(), MemNode::Dir { mode });
        self
    }

    pub fn add_symlink(&mut self, path: &str, target: &str) -> &mut Self {
        self.nodes.insert(
            path.to_string(),
            MemNode::Symlink {
                target: target.to_string(),
            },
        );
        self
    }
}

impl FileSystem for MemFs {
    fn walk(&self) -> Result<Vec<VfsEntry>> {
        // BTreeMap iteration is already sorted by path.
        Ok(self
            .nodes
            .iter()
            .map(|(path, node)| match node {
                MemNode::File { content, mode } => VfsEntry {
                    path: path.clone(),
                    kind: EntryKind::Regular,
                    size: content.len() as u64,
                    mode: 0o100000 | mode,
                    link_target: None,
                },
                MemNode::Dir { mode } => VfsEntry {
                    path: path.clone(),
                    kind: EntryKind::Directory,
                    size: 0,
                    mode: 0o040000 | mode,
                    link_target: None,
                },
                MemNode::Symlink { target } => VfsEntry {
                    path: path.clone(),
                    kind: EntryKind::Symlink,
                    size: 0,
                    mode: 0o120777,
                    link_target: Some(target.clone()),
                },
            })
            .collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send + '_>> {
        match self.nodes.get(path) {
            Some(MemNode::File { content, .. }) => Ok(Box::new(std::io::Cursor::new(content.clone()))),
            Some(_) => Err(SarError::InvalidSource(format!("not a regular file: {}", path))),
            None => Err(SarError::NotFound(format!("no such file: {}", path))),
        }
    }
}
