//! Lexical validation of archive paths, extraction targets and symlinks
//!
//! All checks here are purely lexical; no filesystem access happens. The
//! extractor combines these checks with on-disk ancestor inspection before
//! materializing anything.

use crate::error::{Result, SarError};
use crate::sar::toc::{EntryKind, TocEntry};
use std::path::{Path, PathBuf};

/// Extraction limits; zero means unlimited
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractLimits {
    pub max_files: u64,
    pub max_total_size: u64,
    pub max_file_size: u64,
}

/// Lexical validator for archive entry names and link targets
#[derive(Debug, Clone, Copy, Default)]
pub struct PathValidator;

impl PathValidator {
    pub fn new() -> Self {
        PathValidator
    }

    /// Reject NUL bytes, absolute paths, drive and UNC prefixes, and any
    /// `..` component under either separator convention. Empty paths and `.`
    /// components are accepted.
    pub fn validate_path(&self, path: &str) -> Result<()> {
        if path.contains('\0') {
            return Err(SarError::PathTraversal(format!(
                "path contains NUL byte: {:?}",
                path
            )));
        }
        if has_volume_prefix(path) {
            return Err(SarError::PathTraversal(format!(
                "path has volume or UNC prefix: {}",
                path
            )));
        }
        if path.starts_with('/') || path.starts_with('\\') {
            return Err(SarError::PathTraversal(format!("absolute path: {}", path)));
        }
        for component in split_components(path) {
            if component == ".." {
                return Err(SarError::PathTraversal(format!(
                    "path contains '..' component: {}",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Validate every entry of a table of contents against a destination
    /// directory and the configured limits.
    pub fn validate_extraction<'a, I>(
        &self,
        dest_dir: &Path,
        entries: I,
        limits: &ExtractLimits,
    ) -> Result<()>
    where
        I: IntoIterator<Item = &'a TocEntry>,
    {
        let dest_abs = absolute_dest(dest_dir)?;
        let mut tracker = LimitTracker::new(*limits);
        for entry in entries {
            self.validate_path(&entry.name)?;
            self.check_within(&dest_abs, &entry.name)?;
            if entry.kind == EntryKind::Regular {
                tracker.account_file(&entry.name, entry.size)?;
            }
        }
        Ok(())
    }

    /// Validate a symlink's placement and target
    pub fn validate_symlink(&self, dest_dir: &Path, link_path: &str, target: &str) -> Result<()> {
        self.validate_path(link_path)?;
        if target.contains('\0') {
            return Err(SarError::PathTraversal(format!(
                "link target contains NUL byte: {:?}",
                target
            )));
        }
        if target.starts_with('/') || target.starts_with('\\') {
            return Err(SarError::PathTraversal(format!(
                "absolute link target: {}",
                target
            )));
        }
        if has_volume_prefix(target) {
            return Err(SarError::PathTraversal(format!(
                "link target has volume or UNC prefix: {}",
                target
            )));
        }

        let dest_abs = absolute_dest(dest_dir)?;
        // Resolve clean(link_parent / target) and require it to stay inside
        // the destination.
        let mut stack: Vec<String> = Vec::new();
        let parent_components: Vec<&str> = split_components(link_path).collect();
        for component in parent_components
            .iter()
            .take(parent_components.len().saturating_sub(1))
        {
            push_component(&mut stack, component);
        }
        for component in split_components(target) {
            if !push_component(&mut stack, component) {
                return Err(SarError::PathTraversal(format!(
                    "link target escapes destination: {} -> {}",
                    link_path, target
                )));
            }
        }
        let mut resolved = dest_abs.clone();
        for component in &stack {
            resolved.push(component);
        }
        if !is_within(&dest_abs, &resolved) {
            return Err(SarError::PathTraversal(format!(
                "link target escapes destination: {} -> {}",
                link_path, target
            )));
        }
        Ok(())
    }

    /// Lexically join a validated name under the destination and confirm the
    /// result stays inside. Returns the joined absolute path.
    pub fn check_within(&self, dest_abs: &Path, name: &str) -> Result<PathBuf> {
        let mut joined = dest_abs.to_path_buf();
        for component in split_components(name) {
            if component.is_empty() || component == "." {
                continue;
            }
            if component == ".." {
                return Err(SarError::PathTraversal(format!(
                    "entry escapes destination: {}",
                    name
                )));
            }
            joined.push(component);
        }
        if !is_within(dest_abs, &joined) {
            return Err(SarError::PathTraversal(format!(
                "entry escapes destination: {}",
                name
            )));
        }
        Ok(joined)
    }
}

/// Running enforcement of [`ExtractLimits`] during streaming extraction.
/// Regular files only; directories and symlinks never count.
#[derive(Debug, Clone)]
pub struct LimitTracker {
    limits: ExtractLimits,
    files: u64,
    total_size: u64,
}

impl LimitTracker {
    pub fn new(limits: ExtractLimits) -> Self {
        Self {
            limits,
            files: 0,
            total_size: 0,
        }
    }

    /// Account one regular file; fails before the file should be created.
    pub fn account_file(&mut self, name: &str, size: u64) -> Result<()> {
        if self.limits.max_file_size != 0 && size > self.limits.max_file_size {
            return Err(SarError::ExtractLimits(format!(
                "file {} is {} bytes, limit {}",
                name, size, self.limits.max_file_size
            )));
        }
        self.files = self.files.checked_add(1).ok_or_else(|| {
            SarError::ExtractLimits("file count overflow".to_string())
        })?;
        if self.limits.max_files != 0 && self.files > self.limits.max_files {
            return Err(SarError::ExtractLimits(format!(
                "file count exceeds limit {}",
                self.limits.max_files
            )));
        }
        self.total_size = self.total_size.checked_add(size).ok_or_else(|| {
            SarError::ExtractLimits(format!("total size overflow at {}", name))
        })?;
        if self.limits.max_total_size != 0 && self.total_size > self.limits.max_total_size {
            return Err(SarError::ExtractLimits(format!(
                "total size {} exceeds limit {}",
                self.total_size, self.limits.max_total_size
            )));
        }
        Ok(())
    }

    pub fn files(&self) -> u64 {
        self.files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

/// Absolute form of the destination directory, computed lexically
pub fn absolute_dest(dest: &Path) -> Result<PathBuf> {
    std::path::absolute(dest)
        .map_err(|e| SarError::Io(format!("cannot absolutize {}: {}", dest.display(), e)))
}

fn is_within(root: &Path, candidate: &Path) -> bool {
    // The filesystem root contains every absolute descendant.
    candidate == root || candidate.starts_with(root)
}

/// Split on both separator conventions
fn split_components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\'])
}

fn has_volume_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    let unc = path.starts_with("\\\\") || path.starts_with("//");
    drive || unc
}

/// Push one cleaned component; returns false when `..` would climb above the
/// destination.
fn push_component(stack: &mut Vec<String>, component: &str) -> bool {
    match component {
        "" | "." => true,
        ".." => stack.pop().is_some(),
        other => {
            stack.push(other.to_string());
            true
        }
    }
}
