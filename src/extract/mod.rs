//! Safe materialization of archive streams onto a destination directory
//!
//! The extractor consumes a compressed tar stream (codec auto-detected),
//! validates every entry lexically, checks on-disk ancestors for planted
//! symlinks, creates files with `O_EXCL`, and places symlinks via a `.tmp`
//! rename. Hardlinks, devices and fifos are rejected. Limits are enforced
//! before any byte of a breaching entry is written.

use crate::compress::Codec;
use crate::error::{Result, SarError};
use crate::sar::TOC_ENTRY_NAME;
use crate::validate::{ExtractLimits, LimitTracker, PathValidator, absolute_dest};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const COPY_STEP: usize = 128 * 1024;

/// Counts reported after a successful extraction
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub bytes: u64,
}

/// Streaming extractor with lexical and on-disk safety checks
pub struct Extractor {
    validator: PathValidator,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor {
    pub fn new() -> Self {
        Self {
            validator: PathValidator::new(),
        }
    }

    /// Extract a compressed tar stream into `dest`. The stream's codec is
    /// detected from its first four bytes.
    pub fn extract<R: Read>(
        &self,
        mut reader: R,
        dest: &Path,
        limits: &ExtractLimits,
        cancel: &CancellationToken,
    ) -> Result<ExtractStats> {
        let dest_abs = absolute_dest(dest)?;
        std::fs::create_dir_all(&dest_abs)
            .map_err(|e| SarError::Io(format!("cannot create {}: {}", dest_abs.display(), e)))?;

        let mut prefix = [0u8; 4];
        let mut got = 0;
        while got < prefix.len() {
            let n = reader
                .read(&mut prefix[got..])
                .map_err(|e| SarError::Io(format!("read archive stream failed: {}", e)))?;
            if n == 0 {
                break;
            }
            got += n;
        }
        let codec = Codec::detect(&prefix[..got])?;
        let chained = std::io::Cursor::new(prefix[..got].to_vec()).chain(reader);
        let decoder = codec.stream_decoder(chained)?;

        let mut archive = tar::Archive::new(decoder);
        let mut tracker = LimitTracker::new(*limits);
        let mut created_dirs: HashSet<PathBuf> = HashSet::new();
        let mut stats = ExtractStats::default();

        let entries = archive
            .entries()
            .map_err(|e| SarError::InvalidArchive(format!("tar stream unreadable: {}", e)))?;
        for entry in entries {
            if cancel.is_cancelled() {
                return Err(SarError::Cancelled("extraction cancelled".to_string()));
            }
            let mut entry =
                entry.map_err(|e| SarError::InvalidArchive(format!("tar entry unreadable: {}", e)))?;

            let raw_name = entry
                .path()
                .map_err(|e| SarError::InvalidArchive(format!("entry path unreadable: {}", e)))?
                .to_str()
                .ok_or_else(|| SarError::InvalidArchive("entry path not UTF-8".to_string()))?
                .to_string();
            let name = raw_name.trim_end_matches('/').to_string();
            if name == TOC_ENTRY_NAME {
                continue;
            }

            self.validator.validate_path(&name)?;
            let target = self.validator.check_within(&dest_abs, &name)?;
            check_ancestors(&dest_abs, &target, &created_dirs)?;

            let entry_type = entry.header().entry_type();
            let mode = entry
                .header()
                .mode()
                .map_err(|e| SarError::InvalidArchive(format!("entry mode unreadable: {}", e)))?
                & 0o7777;
            let declared_size = entry.header().size();

            match entry_type {
                tar::EntryType::Directory => {
                    make_dir(&target, mode)?;
                    created_dirs.insert(target);
                    stats.directories += 1;
                }
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let size = declared_size.map_err(|e| {
                        SarError::ExtractLimits(format!("invalid size for {}: {}", name, e))
                    })?;
                    tracker.account_file(&name, size)?;
                    ensure_parent(&target, &dest_abs, &mut created_dirs)?;
                    stats.bytes += self.write_file(&mut entry, &target, mode, cancel)?;
                    stats.files += 1;
                }
                tar::EntryType::Symlink => {
                    let link_target = entry
                        .link_name()
                        .map_err(|e| {
                            SarError::InvalidArchive(format!("link target unreadable: {}", e))
                        })?
                        .ok_or_else(|| {
                            SarError::InvalidArchive(format!("symlink {} has no target", name))
                        })?
                        .to_str()
                        .ok_or_else(|| {
                            SarError::InvalidArchive("link target not UTF-8".to_string())
                        })?
                        .to_string();
                    self.validator.validate_symlink(&dest_abs, &name, &link_target)?;
                    ensure_parent(&target, &dest_abs, &mut created_dirs)?;
                    place_symlink(&target, &link_target)?;
                    stats.symlinks += 1;
                }
                tar::EntryType::Link => {
                    return Err(SarError::InvalidArchive(format!(
                        "hardlink entries are not supported: {}",
                        name
                    )));
                }
                tar::EntryType::Char | tar::EntryType::Block | tar::EntryType::Fifo => {
                    return Err(SarError::InvalidArchive(format!(
                        "device and fifo entries are not supported: {}",
                        name
                    )));
                }
                other => {
                    return Err(SarError::InvalidArchive(format!(
                        "unsupported tar entry type {:?} at {}",
                        other, name
                    )));
                }
            }
        }
        Ok(stats)
    }

    /// Create with `O_CREAT|O_EXCL|O_WRONLY` so a pre-planted path of the same
    /// name fails the extraction instead of being followed.
    fn write_file<R: Read>(
        &self,
        entry: &mut R,
        target: &Path,
        mode: u32,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(target)
            .map_err(|e| SarError::Io(format!("create {} failed: {}", target.display(), e)))?;

        let mut buf = vec![0u8; COPY_STEP];
        let mut written = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(SarError::Cancelled("extraction cancelled".to_string()));
            }
            let n = entry
                .read(&mut buf)
                .map_err(|e| SarError::InvalidArchive(format!("entry content unreadable: {}", e)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| SarError::Io(format!("write {} failed: {}", target.display(), e)))?;
            written += n as u64;
        }
        Ok(written)
    }
}

/// No ancestor inside the destination may be a symlink on disk. Directories
/// this extraction created are trusted and skipped.
fn check_ancestors(dest_abs: &Path, target: &Path, created_dirs: &HashSet<PathBuf>) -> Result<()> {
    let mut current = dest_abs.to_path_buf();
    let rel = target.strip_prefix(dest_abs).map_err(|_| {
        SarError::PathTraversal(format!("entry escapes destination: {}", target.display()))
    })?;
    let components: Vec<_> = rel.components().collect();
    for component in components.iter().take(components.len().saturating_sub(1)) {
        current.push(component);
        if created_dirs.contains(&current) {
            continue;
        }
        match std::fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SarError::PathTraversal(format!(
                    "ancestor {} is a symlink",
                    current.display()
                )));
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    Ok(())
}

fn make_dir(target: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().mode(mode).create(target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && target.is_dir() => Ok(()),
        Err(e) => Err(SarError::Io(format!(
            "mkdir {} failed: {}",
            target.display(),
            e
        ))),
    }
}

/// Create missing parents with a default mode; archives usually list parent
/// directories first, so this is the exception path.
fn ensure_parent(target: &Path, dest_abs: &Path, created_dirs: &mut HashSet<PathBuf>) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    if parent == dest_abs || created_dirs.contains(parent) || parent.is_dir() {
        return Ok(());
    }
    let mut current = dest_abs.to_path_buf();
    let rel = parent
        .strip_prefix(dest_abs)
        .map_err(|_| SarError::PathTraversal(format!("bad parent for {}", target.display())))?;
    for component in rel.components() {
        current.push(component);
        if current.is_dir() {
            continue;
        }
        make_dir(&current, 0o755)?;
        created_dirs.insert(current.clone());
    }
    Ok(())
}

/// Create the link under a `.tmp` name, then atomically rename into place so
/// a pre-existing file of the final name cannot be followed mid-extraction.
fn place_symlink(target: &Path, link_target: &str) -> Result<()> {
    let tmp = target.with_file_name(format!(
        "{}.tmp",
        target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(".sarball-link")
    ));
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(link_target, &tmp)
        .map_err(|e| SarError::Io(format!("symlink {} failed: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, target).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        SarError::Io(format!("rename {} failed: {}", target.display(), e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sar::builder::{BuildOptions, SarBuilder};
    use crate::vfs::MemFs;
    use std::io::Seek;

    fn build_blob(fs: &MemFs, codec: Codec) -> Vec<u8> {
        let mut result = SarBuilder::new(BuildOptions {
            codec,
            ..Default::default()
        })
        .build(fs, &CancellationToken::new())
        .unwrap();
        let mut bytes = Vec::new();
        result.blob.rewind().unwrap();
        result.blob.read_to_end(&mut bytes).unwrap();
        bytes
    }

    fn extract_all(blob: &[u8], dest: &Path, limits: &ExtractLimits) -> Result<ExtractStats> {
        Extractor::new().extract(blob, dest, limits, &CancellationToken::new())
    }

    fn sample_fs() -> MemFs {
        let mut fs = MemFs::new();
        fs.add_file("hello.txt", b"Hello, World!".to_vec(), 0o644)
            .add_dir("subdir", 0o755)
            .add_file("subdir/nested.txt", b"Nested".to_vec(), 0o600)
            .add_symlink("link", "hello.txt");
        fs
    }

    #[test]
    fn test_round_trip_matches_source() {
        use std::os::unix::fs::PermissionsExt;
        for codec in [Codec::Gzip, Codec::Zstd] {
            let fs = sample_fs();
            let blob = build_blob(&fs, codec);
            let dest = tempfile::tempdir().unwrap();
            let stats = extract_all(&blob, dest.path(), &Default::default()).unwrap();
            assert_eq!(stats.files, 2);
            assert_eq!(stats.directories, 1);
            assert_eq!(stats.symlinks, 1);

            assert_eq!(
                std::fs::read(dest.path().join("hello.txt")).unwrap(),
                b"Hello, World!"
            );
            assert_eq!(
                std::fs::read(dest.path().join("subdir/nested.txt")).unwrap(),
                b"Nested"
            );
            let mode = std::fs::metadata(dest.path().join("subdir/nested.txt"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o7777, 0o600);
            let link = std::fs::read_link(dest.path().join("link")).unwrap();
            assert_eq!(link.to_str().unwrap(), "hello.txt");
        }
    }

    #[test]
    fn test_toc_sentinel_not_materialized() {
        let blob = build_blob(&sample_fs(), Codec::Gzip);
        let dest = tempfile::tempdir().unwrap();
        extract_all(&blob, dest.path(), &Default::default()).unwrap();
        assert!(!dest.path().join(TOC_ENTRY_NAME).exists());
    }

    fn hostile_tar(name: &str, content: &[u8]) -> Vec<u8> {
        // Hand-rolled header so hostile names survive encoding.
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            let bytes = name.as_bytes();
            gnu.name[..bytes.len()].copy_from_slice(bytes);
        }
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        let mut out = Vec::new();
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(content);
        out.resize(out.len().div_ceil(512) * 512, 0);
        out.extend_from_slice(&[0u8; 1024]);
        out
    }

    #[test]
    fn test_traversal_entry_rejected_before_writing() {
        let tar_bytes = hostile_tar("../escape.txt", b"pwned");
        let blob = Codec::Gzip.compress_frame(&tar_bytes).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let err = extract_all(&blob, dest.path(), &Default::default()).unwrap_err();
        assert!(matches!(err, SarError::PathTraversal(_)));
        assert!(std::fs::read_dir(dest.path()).unwrap().next().is_none());
        assert!(!dest.path().parent().unwrap().join("escape.txt").exists());
    }

    #[test]
    fn test_max_files_limit() {
        let mut fs = MemFs::new();
        for i in 0..20 {
            fs.add_file(&format!("f{:02}", i), vec![b'x'; 100], 0o644);
        }
        let blob = build_blob(&fs, Codec::Gzip);
        let dest = tempfile::tempdir().unwrap();
        let limits = ExtractLimits {
            max_files: 5,
            ..Default::default()
        };
        let err = extract_all(&blob, dest.path(), &limits).unwrap_err();
        assert!(matches!(err, SarError::ExtractLimits(_)));
        let created = std::fs::read_dir(dest.path()).unwrap().count();
        assert!(created <= 5, "created {} files", created);
    }

    #[test]
    fn test_max_total_size_limit() {
        let mut fs = MemFs::new();
        fs.add_file("a", vec![b'x'; 600], 0o644)
            .add_file("b", vec![b'x'; 600], 0o644);
        let blob = build_blob(&fs, Codec::Gzip);
        let dest = tempfile::tempdir().unwrap();
        let limits = ExtractLimits {
            max_total_size: 1000,
            ..Default::default()
        };
        assert!(matches!(
            extract_all(&blob, dest.path(), &limits).unwrap_err(),
            SarError::ExtractLimits(_)
        ));
    }

    #[test]
    fn test_existing_file_blocks_extraction() {
        let fs = sample_fs();
        let blob = build_blob(&fs, Codec::Gzip);
        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("hello.txt"), b"planted").unwrap();
        assert!(extract_all(&blob, dest.path(), &Default::default()).is_err());
    }

    #[test]
    fn test_symlink_ancestor_rejected() {
        let mut fs = MemFs::new();
        fs.add_file("sub/file.txt", b"x".to_vec(), 0o644);
        let blob = build_blob(&fs, Codec::Gzip);
        let dest = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dest.path().join("sub")).unwrap();
        let err = extract_all(&blob, dest.path(), &Default::default()).unwrap_err();
        assert!(matches!(err, SarError::PathTraversal(_)));
        assert!(std::fs::read_dir(outside.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_cancellation() {
        let blob = build_blob(&sample_fs(), Codec::Gzip);
        let dest = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Extractor::new()
            .extract(&blob[..], dest.path(), &Default::default(), &cancel)
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_hardlink_rejected() {
        let mut header = tar::Header::new_gnu();
        {
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..5].copy_from_slice(b"alias");
            gnu.linkname[..6].copy_from_slice(b"target");
        }
        header.set_size(0);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Link);
        header.set_cksum();
        let mut tar_bytes = Vec::new();
        tar_bytes.extend_from_slice(header.as_bytes());
        tar_bytes.extend_from_slice(&[0u8; 1024]);
        let blob = Codec::Gzip.compress_frame(&tar_bytes).unwrap();
        let dest = tempfile::tempdir().unwrap();
        assert!(matches!(
            extract_all(&blob, dest.path(), &Default::default()).unwrap_err(),
            SarError::InvalidArchive(_)
        ));
    }
}
