//! The standby-slot builder: turns a [`Manifest`] plus a [`DeltaPlan`] into
//! a fully materialized standby rootfs, phase by phase. See spec.md §4.E.
//!
//! Phases run strictly in order (directories before regulars, regulars
//! before symlinks, symlinks before persistents) since later phases assume
//! earlier ones have already created their parent directories. Within the
//! regular-file phase, buckets are processed with bounded concurrency; the
//! first worker to claim a hardlink group downloads or copies, every other
//! worker in the same group waits and links.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use camino::Utf8PathBuf;
use tokio::sync::Semaphore;

use crate::delta::{compute_delta, scan_standby, DeltaPlan, HashBucket};
use crate::download::{CacheControl, Downloader};
use crate::error::{OtaError, Result};
use crate::hardlink::{link_into_group, HardlinkRegister, HardlinkRole};
use crate::manifest::{Manifest, RegularEntry};
use crate::stats::{RegularFileOp, RegularFileStat, StatsCollector};

/// Where to fetch bucket content from and where a freshly rebuilt standby
/// slot lives.
#[derive(Debug, Clone)]
pub struct StandbyPaths {
    /// Root of the standby rootfs mount, e.g. `/mnt/standby`.
    pub standby_root: Utf8PathBuf,
    /// Scratch directory new content lands in before the final path is
    /// linked/renamed into place, e.g. `/var/tmp/ota-tmp`.
    pub tmp_pool: Utf8PathBuf,
    /// Root of the currently active rootfs, used as a copy source for the
    /// `hold_set` and for resolving `persistents.txt` entries.
    pub active_root: Utf8PathBuf,
    /// Base URL the manifest's `rootfs_directory` is resolved against.
    pub image_base_url: String,
}

/// Drives one standby-slot rebuild from a verified manifest to a fully
/// populated standby rootfs.
#[derive(Debug)]
pub struct StandbySlotBuilder {
    paths: StandbyPaths,
    downloader: Downloader,
    stats: Arc<StatsCollector>,
    task_semaphore: Arc<Semaphore>,
    hardlinks: Arc<HardlinkRegister>,
}

impl StandbySlotBuilder {
    /// Build a builder for one rebuild attempt.
    pub fn new(paths: StandbyPaths, downloader: Downloader, stats: Arc<StatsCollector>, max_concurrent_tasks: usize) -> Self {
        Self {
            paths,
            downloader,
            stats,
            task_semaphore: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            hardlinks: Arc::new(HardlinkRegister::new()),
        }
    }

    /// Compute the delta plan for `manifest` against whatever is already on
    /// the standby slot (a fresh slot yields an all-`new_set` plan).
    pub fn compute_delta(&self, manifest: &Manifest) -> Result<DeltaPlan> {
        let inventory = scan_standby(self.paths.standby_root.as_std_path()).map_err(OtaError::Io)?;
        Ok(compute_delta(&manifest.regulars, &inventory))
    }

    /// Phase 1: create every directory `dirs.txt` names, in manifest order
    /// (which the image builder is expected to emit parent-before-child).
    pub fn materialize_directories(&self, manifest: &Manifest) -> Result<()> {
        for dir in &manifest.directories {
            let path = self.standby_path(dir.path.as_str());
            std::fs::create_dir_all(&path)?;
            std::fs::set_permissions(&path, std::os::unix::fs::PermissionsExt::from_mode(dir.mode))?;
            nix::unistd::chown(
                &path,
                Some(nix::unistd::Uid::from_raw(dir.uid)),
                Some(nix::unistd::Gid::from_raw(dir.gid)),
            )
            .map_err(|e| OtaError::Unrecoverable(anyhow::anyhow!("chown {path:?}: {e}")))?;
        }
        Ok(())
    }

    /// Phase 2: materialize every regular file via the delta plan, with
    /// bounded concurrency and hardlink-group coordination.
    pub async fn materialize_regulars(&self, plan: &DeltaPlan) -> Result<()> {
        let mut handles = Vec::new();
        for bucket in plan.new_set.iter().chain(plan.hold_set.iter()).cloned().collect::<Vec<_>>() {
            let permit = self.task_semaphore.clone();
            handles.push(self.spawn_bucket(bucket, permit));
        }
        for handle in handles {
            handle.await??;
        }
        Ok(())
    }

    /// Every entry within one [`HashBucket`] shares its content hash, so the
    /// single task that owns the bucket materializes one "first copy" in the
    /// temp pool and then applies each entry in turn: entries with `nlink ==
    /// 1` just get their own copy (or, for the last entry, the temp file
    /// itself, moved rather than copied) since nothing else on the source
    /// rootfs pointed at the same inode; entries with `nlink > 1` go through
    /// [`HardlinkRegister`] so concurrent buckets racing on the same manifest
    /// `inode` tag still produce one writer and N-1 linkers sharing one
    /// inode on standby.
    fn spawn_bucket(&self, bucket: HashBucket, semaphore: Arc<Semaphore>) -> tokio::task::JoinHandle<Result<()>> {
        let standby_root = self.paths.standby_root.clone();
        let active_root = self.paths.active_root.clone();
        let tmp_pool = self.paths.tmp_pool.clone();
        let image_base_url = self.paths.image_base_url.clone();
        let rootfs_directory_entries = bucket.entries.clone();
        let hash = bucket.hash;
        let stats = self.stats.clone();
        let downloader = self.downloader.clone();
        let hardlinks = self.hardlinks.clone();

        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            materialize_one_bucket(
                &standby_root,
                &active_root,
                &tmp_pool,
                &image_base_url,
                hash,
                &rootfs_directory_entries,
                &stats,
                &downloader,
                &hardlinks,
            )
            .await
        })
    }

    fn standby_path(&self, manifest_path: &str) -> PathBuf {
        self.paths
            .standby_root
            .join(manifest_path.trim_start_matches('/'))
            .into_std_path_buf()
    }
}

async fn materialize_one_bucket(
    standby_root: &Utf8PathBuf,
    active_root: &Utf8PathBuf,
    tmp_pool: &Utf8PathBuf,
    image_base_url: &str,
    hash: crate::manifest::Sha256,
    entries: &[RegularEntry],
    stats: &StatsCollector,
    downloader: &Downloader,
    hardlinks: &HardlinkRegister,
) -> Result<()> {
    let started = Instant::now();
    let first = entries.first().expect("bucket always has at least one entry");

    // Step a: ensure a single "first copy" of this hash exists in the temp
    // pool, reused by every entry below instead of fetched per entry.
    let tmp_first = tmp_pool.join(format!("{hash}.first"));
    let active_copy = active_root.join(first.path.as_str().trim_start_matches('/'));
    let (op, retries, bytes) = if active_copy.exists() && hash_matches(active_copy.as_std_path(), hash) {
        std::fs::create_dir_all(tmp_pool.as_std_path())?;
        std::fs::copy(&active_copy, &tmp_first)?;
        (RegularFileOp::CopyHold, 0, 0)
    } else if first.compressed {
        download_and_decompress(downloader, tmp_pool, image_base_url, first, hash, &tmp_first).await?
    } else {
        let url = format!("{image_base_url}/{}", first.path.as_str().trim_start_matches('/'));
        let outcome = downloader
            .download(&url, tmp_first.as_std_path(), hash, first.size, CacheControl::UseCache, None, &[])
            .await?;
        (RegularFileOp::Download, outcome.retry_count, outcome.bytes_downloaded)
    };
    stats.report(RegularFileStat {
        op,
        bytes_downloaded: bytes,
        download_retries: retries,
        elapsed: started.elapsed(),
    });

    // Step b: distribute the first copy to every bucket entry, per spec.md
    // §4.E.4.b: move the last nlink==1 entry (consuming the temp file), copy
    // every other nlink==1 entry, and route nlink>1 entries through the
    // hardlink register so only one of them actually copies from temp.
    let last_index = entries.len() - 1;
    for (i, entry) in entries.iter().enumerate() {
        let is_last = i == last_index;
        let dest = standby_root.join(entry.path.as_str().trim_start_matches('/'));
        std::fs::create_dir_all(dest.parent().expect("has parent"))?;

        let entry_started = Instant::now();
        let op = if entry.nlink <= 1 {
            if is_last {
                move_or_copy(tmp_first.as_std_path(), dest.as_std_path())?;
            } else {
                std::fs::copy(&tmp_first, &dest)?;
            }
            RegularFileOp::CopyHold
        } else {
            let key = (entry.inode.unwrap_or(0), entry.size.unwrap_or(0));
            match hardlinks.get_tracker(key, entry.nlink as u64) {
                HardlinkRole::Writer(tracker) => {
                    if let Err(e) = std::fs::copy(&tmp_first, &dest) {
                        tracker.writer_failed();
                        return Err(OtaError::Io(e));
                    }
                    tracker.writer_done(dest.clone().into_std_path_buf());
                    RegularFileOp::CopyHold
                }
                HardlinkRole::Linker(tracker) => match tracker.subscribe().await {
                    Some(winner) => {
                        link_into_group(&winner, dest.as_std_path())?;
                        tracker.record_link();
                        RegularFileOp::Link
                    }
                    None => {
                        std::fs::copy(&tmp_first, &dest)?;
                        RegularFileOp::CopyHold
                    }
                },
            }
        };
        apply_entry_mode(&dest, entry)?;
        stats.report(RegularFileStat {
            op,
            bytes_downloaded: 0,
            download_retries: 0,
            elapsed: entry_started.elapsed(),
        });
    }
    let _ = std::fs::remove_file(&tmp_first);
    Ok(())
}

/// Move `src` into `dst`, falling back to copy-then-remove if they straddle
/// filesystems (the temp pool and the standby mount need not share a device).
fn move_or_copy(src: &Path, dst: &Path) -> Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32) => {
            std::fs::copy(src, dst)?;
            std::fs::remove_file(src)?;
            Ok(())
        }
        Err(e) => Err(OtaError::Io(e)),
    }
}

/// The remote payload for this entry is stored zstd-compressed (a `.zst`
/// sibling of the path `rootfs_directory` names); `entry.hash` is the hash
/// of the *decompressed* content, so the wire bytes can't be verified
/// streaming the way [`Downloader::download`] does for plain entries.
/// Fetched unverified, decompressed on a blocking thread, then hash-checked
/// before the rename into place.
async fn download_and_decompress(
    downloader: &Downloader,
    tmp_pool: &Utf8PathBuf,
    image_base_url: &str,
    entry: &RegularEntry,
    hash: crate::manifest::Sha256,
    final_path: &Utf8PathBuf,
) -> Result<(RegularFileOp, u32, u64)> {
    let tmp_compressed = tmp_pool.join(format!("{hash}.zst.part"));
    let url = format!("{image_base_url}/{}.zst", entry.path.as_str().trim_start_matches('/'));
    let outcome = downloader
        .download_unverified(&url, tmp_compressed.as_std_path(), CacheControl::UseCache)
        .await?;

    let tmp_dst = tmp_pool.join(format!("{hash}.part"));
    let compressed_path = tmp_compressed.clone().into_std_path_buf();
    let decompressed_path = tmp_dst.clone().into_std_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let src = std::fs::File::open(&compressed_path)?;
        let mut dst = std::fs::File::create(&decompressed_path)?;
        zstd::stream::copy_decode(src, &mut dst).map_err(OtaError::Io)
    })
    .await
    .map_err(|e| OtaError::Unrecoverable(anyhow::anyhow!("decompression task panicked: {e}")))??;
    let _ = std::fs::remove_file(&tmp_compressed);

    if !hash_matches(tmp_dst.as_std_path(), hash) {
        let _ = std::fs::remove_file(&tmp_dst);
        return Err(OtaError::DownloadExhausted {
            url,
            attempts: 1,
            source: anyhow::anyhow!("decompressed content hash mismatch"),
        });
    }
    std::fs::create_dir_all(final_path.parent().expect("has parent"))?;
    std::fs::rename(&tmp_dst, final_path)?;
    Ok((RegularFileOp::Download, outcome.retry_count, outcome.bytes_downloaded))
}

fn apply_entry_mode(path: &Utf8PathBuf, entry: &RegularEntry) -> Result<()> {
    std::fs::set_permissions(path, std::os::unix::fs::PermissionsExt::from_mode(entry.mode))?;
    nix::unistd::chown(
        path.as_std_path(),
        Some(nix::unistd::Uid::from_raw(entry.uid)),
        Some(nix::unistd::Gid::from_raw(entry.gid)),
    )
    .map_err(|e| OtaError::Unrecoverable(anyhow::anyhow!("chown {path}: {e}")))
}

fn hash_matches(path: &Path, expected: crate::manifest::Sha256) -> bool {
    use sha2::{Digest, Sha256 as Sha256Hasher};
    let Ok(bytes) = std::fs::read(path) else { return false };
    let mut hasher = Sha256Hasher::new();
    hasher.update(&bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    crate::manifest::Sha256(digest) == expected
}

/// Phase 3: create every symlink `symlinks.txt` names.
pub fn materialize_symlinks(paths: &StandbyPaths, manifest: &Manifest) -> Result<()> {
    for link in &manifest.symlinks {
        let link_path = paths.standby_root.join(link.linkpath.as_str().trim_start_matches('/'));
        if let Some(parent) = link_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if link_path.exists() || link_path.as_std_path().symlink_metadata().is_ok() {
            std::fs::remove_file(&link_path).ok();
        }
        std::os::unix::fs::symlink(link.target.as_str(), &link_path)?;
    }
    Ok(())
}

/// Phase 4: copy every `persistents.txt` path verbatim from the active slot.
pub fn materialize_persistents(paths: &StandbyPaths, manifest: &Manifest) -> Result<()> {
    for entry in &manifest.persistents {
        let src = paths.active_root.join(entry.path.as_str().trim_start_matches('/'));
        let dst = paths.standby_root.join(entry.path.as_str().trim_start_matches('/'));
        if !src.exists() {
            tracing::warn!(path = %entry.path, "persistent path missing on active slot, skipping");
            continue;
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        copy_recursive(src.as_std_path(), dst.as_std_path())?;
    }
    Ok(())
}

fn copy_recursive(src: &Path, dst: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir_all(dst)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if meta.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        let _ = std::fs::remove_file(dst);
        std::os::unix::fs::symlink(target, dst)?;
    } else {
        std::fs::copy(src, dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DirectoryEntry, Sha256};
    use std::time::Duration as StdDuration;

    fn builder(standby: &Path, active: &Path, tmp: &Path) -> StandbySlotBuilder {
        let paths = StandbyPaths {
            standby_root: Utf8PathBuf::from_path_buf(standby.to_path_buf()).unwrap(),
            tmp_pool: Utf8PathBuf::from_path_buf(tmp.to_path_buf()).unwrap(),
            active_root: Utf8PathBuf::from_path_buf(active.to_path_buf()).unwrap(),
            image_base_url: "http://localhost/unused".into(),
        };
        let (stats, _handle) = StatsCollector::spawn(StdDuration::from_millis(50), 0, 0);
        StandbySlotBuilder::new(paths, Downloader::new(1, otaclient_utils::BackoffPolicy::default()), stats, 2)
    }

    #[test]
    fn materialize_directories_creates_tree() {
        let standby = tempfile::tempdir().unwrap();
        let active = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let b = builder(standby.path(), active.path(), tmp.path());
        let manifest = Manifest {
            version: 1,
            rootfs_directory: "rootfs".into(),
            directories: vec![DirectoryEntry {
                mode: 0o755,
                uid: 0,
                gid: 0,
                path: Utf8PathBuf::from("/etc/foo"),
            }],
            symlinks: vec![],
            regulars: vec![],
            persistents: vec![],
            total_regular_size: None,
        };
        b.materialize_directories(&manifest).unwrap();
        assert!(standby.path().join("etc/foo").is_dir());
    }

    #[test]
    fn symlinks_are_created_pointing_at_target() {
        let standby = tempfile::tempdir().unwrap();
        let active = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let paths = StandbyPaths {
            standby_root: Utf8PathBuf::from_path_buf(standby.path().to_path_buf()).unwrap(),
            tmp_pool: Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap(),
            active_root: Utf8PathBuf::from_path_buf(active.path().to_path_buf()).unwrap(),
            image_base_url: "http://localhost/unused".into(),
        };
        let manifest = Manifest {
            version: 1,
            rootfs_directory: "rootfs".into(),
            directories: vec![],
            symlinks: vec![crate::manifest::SymlinkEntry {
                mode: 0o777,
                uid: 0,
                gid: 0,
                linkpath: Utf8PathBuf::from("/etc/localtime"),
                target: Utf8PathBuf::from("/usr/share/zoneinfo/UTC"),
            }],
            regulars: vec![],
            persistents: vec![],
            total_regular_size: None,
        };
        materialize_symlinks(&paths, &manifest).unwrap();
        let link = standby.path().join("etc/localtime");
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("/usr/share/zoneinfo/UTC"));
    }

    #[test]
    fn persistents_copy_from_active_to_standby() {
        let standby = tempfile::tempdir().unwrap();
        let active = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(active.path().join("machine-id"), "abc123").unwrap();
        let paths = StandbyPaths {
            standby_root: Utf8PathBuf::from_path_buf(standby.path().to_path_buf()).unwrap(),
            tmp_pool: Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap(),
            active_root: Utf8PathBuf::from_path_buf(active.path().to_path_buf()).unwrap(),
            image_base_url: "http://localhost/unused".into(),
        };
        let manifest = Manifest {
            version: 1,
            rootfs_directory: "rootfs".into(),
            directories: vec![],
            symlinks: vec![],
            regulars: vec![],
            persistents: vec![crate::manifest::PersistentEntry {
                path: Utf8PathBuf::from("/machine-id"),
            }],
            total_regular_size: None,
        };
        materialize_persistents(&paths, &manifest).unwrap();
        assert_eq!(std::fs::read_to_string(standby.path().join("machine-id")).unwrap(), "abc123");
    }

    #[test]
    fn zstd_round_trip_recovers_original_content_hash() {
        let dir = tempfile::tempdir().unwrap();
        let original = b"the quick brown fox jumps over the lazy dog";
        let compressed = zstd::stream::encode_all(&original[..], 3).unwrap();
        let compressed_path = dir.path().join("blob.zst");
        std::fs::write(&compressed_path, &compressed).unwrap();

        let decompressed_path = dir.path().join("blob");
        let src = std::fs::File::open(&compressed_path).unwrap();
        let mut dst = std::fs::File::create(&decompressed_path).unwrap();
        zstd::stream::copy_decode(src, &mut dst).unwrap();

        use sha2::{Digest, Sha256 as Sha256Hasher};
        let mut hasher = Sha256Hasher::new();
        hasher.update(original);
        let digest: [u8; 32] = hasher.finalize().into();
        assert!(hash_matches(&decompressed_path, Sha256(digest)));
    }

    #[test]
    fn hash_matches_checks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        use sha2::{Digest, Sha256 as Sha256Hasher};
        let mut hasher = Sha256Hasher::new();
        hasher.update(b"hello");
        let digest: [u8; 32] = hasher.finalize().into();
        assert!(hash_matches(&path, Sha256(digest)));
        assert!(!hash_matches(&path, Sha256([0; 32])));
    }

    fn sha256_of(content: &[u8]) -> Sha256 {
        use sha2::{Digest, Sha256 as Sha256Hasher};
        let mut hasher = Sha256Hasher::new();
        hasher.update(content);
        Sha256(hasher.finalize().into())
    }

    #[tokio::test]
    async fn duplicate_hash_entries_with_nlink_one_get_independent_inodes() {
        use std::os::unix::fs::MetadataExt;

        let standby = tempfile::tempdir().unwrap();
        let active = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let content = b"two unrelated files that happen to match";
        std::fs::write(active.path().join("a"), content).unwrap();
        let hash = sha256_of(content);

        let entry = |path: &str| RegularEntry {
            mode: 0o644,
            uid: 0,
            gid: 0,
            nlink: 1,
            sha256: hash,
            path: Utf8PathBuf::from(path),
            size: Some(content.len() as u64),
            inode: None,
            compressed: false,
        };
        let plan = DeltaPlan {
            new_set: vec![HashBucket {
                hash,
                entries: vec![entry("/a"), entry("/b")],
            }],
            hold_set: vec![],
            obsolete_set: vec![],
        };

        let b = builder(standby.path(), active.path(), tmp.path());
        b.materialize_regulars(&plan).await.unwrap();

        let ino_a = std::fs::metadata(standby.path().join("a")).unwrap().ino();
        let ino_b = std::fs::metadata(standby.path().join("b")).unwrap().ino();
        assert_ne!(ino_a, ino_b, "nlink==1 siblings sharing a hash must not be hardlinked together");
        assert!(!tmp.path().join(format!("{hash}.first")).exists(), "temp copy is cleaned up after the last entry");
    }

    #[tokio::test]
    async fn hardlink_group_with_nlink_greater_than_one_shares_one_inode() {
        use std::os::unix::fs::MetadataExt;

        let standby = tempfile::tempdir().unwrap();
        let active = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let content = b"shared payload for a real hardlink group";
        std::fs::write(active.path().join("a"), content).unwrap();
        let hash = sha256_of(content);

        let entry = |path: &str| RegularEntry {
            mode: 0o644,
            uid: 0,
            gid: 0,
            nlink: 3,
            sha256: hash,
            path: Utf8PathBuf::from(path),
            size: Some(content.len() as u64),
            inode: Some(9001),
            compressed: false,
        };
        let plan = DeltaPlan {
            new_set: vec![HashBucket {
                hash,
                entries: vec![entry("/a"), entry("/b"), entry("/c")],
            }],
            hold_set: vec![],
            obsolete_set: vec![],
        };

        let b = builder(standby.path(), active.path(), tmp.path());
        b.materialize_regulars(&plan).await.unwrap();

        let inodes: Vec<u64> = ["a", "b", "c"].iter().map(|p| std::fs::metadata(standby.path().join(p)).unwrap().ino()).collect();
        assert_eq!(inodes.iter().collect::<std::collections::HashSet<_>>().len(), 1);
    }
}
