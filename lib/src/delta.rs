//! Delta calculation between the manifest's target rootfs and whatever is
//! already materialized on the standby slot from a previous, possibly
//! interrupted, rebuild.
//!
//! Every regular-file content hash referenced by the manifest is bucketed
//! into one of three sets (spec.md §3's `DeltaPlan`):
//!
//! - `new_set`: hashes the standby slot does not have; must be downloaded.
//! - `hold_set`: hashes already present on standby (left over from a prior
//!   partial rebuild, or shared with the active slot); reused as a copy
//!   source instead of re-downloaded.
//! - `obsolete_set`: paths present on standby but absent from the target
//!   manifest entirely; removed once the rebuild completes successfully.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::manifest::{RegularEntry, Sha256};

/// One content hash and every manifest entry that shares it, i.e. one
/// hardlink-or-duplicate group keyed by `sha256`.
#[derive(Debug, Clone)]
pub struct HashBucket {
    /// The shared content digest.
    pub hash: Sha256,
    /// Every target entry whose content matches `hash`.
    pub entries: Vec<RegularEntry>,
}

impl HashBucket {
    /// Total bytes this bucket would cost to download once (not per-entry;
    /// entries in the bucket hardlink/copy from a single materialized copy).
    pub fn download_size(&self) -> u64 {
        self.entries.iter().filter_map(|e| e.size).max().unwrap_or(0)
    }
}

/// The outcome of comparing a manifest's regular-file set against an
/// inventory of content hashes already present on the standby slot.
#[derive(Debug, Clone, Default)]
pub struct DeltaPlan {
    /// Buckets that must be fetched from the update server.
    pub new_set: Vec<HashBucket>,
    /// Buckets already present locally; reused as copy sources.
    pub hold_set: Vec<HashBucket>,
    /// Standby-slot paths not referenced by the target manifest at all.
    pub obsolete_set: Vec<camino::Utf8PathBuf>,
}

impl DeltaPlan {
    /// Total bytes the `new_set` would need to download, for progress
    /// reporting and the stats collector's `total_bytes` seed.
    pub fn total_download_bytes(&self) -> u64 {
        self.new_set.iter().map(HashBucket::download_size).sum()
    }

    /// Total number of distinct content blobs that must be downloaded.
    pub fn new_file_count(&self) -> usize {
        self.new_set.len()
    }
}

/// What the caller already knows about the standby slot's current contents:
/// every content hash present there, plus every path currently occupying
/// that slot (for obsolete-path detection).
#[derive(Debug, Clone, Default)]
pub struct StandbyInventory {
    /// Content hashes already materialized somewhere on standby.
    pub hashes_present: HashSet<Sha256>,
    /// Every regular-file path currently present on standby.
    pub paths_present: HashSet<camino::Utf8PathBuf>,
}

impl StandbyInventory {
    /// An inventory describing a slot with nothing on it: every hash is new,
    /// nothing is obsolete.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Compute the [`DeltaPlan`] for `target`, the manifest's full regular-file
/// list, against `inventory`, a description of what standby already has.
pub fn compute_delta(target: &[RegularEntry], inventory: &StandbyInventory) -> DeltaPlan {
    let mut buckets: HashMap<Sha256, Vec<RegularEntry>> = HashMap::new();
    for entry in target {
        buckets.entry(entry.sha256).or_default().push(entry.clone());
    }

    let mut plan = DeltaPlan::default();
    for (hash, entries) in buckets {
        let bucket = HashBucket { hash, entries };
        if inventory.hashes_present.contains(&hash) {
            plan.hold_set.push(bucket);
        } else {
            plan.new_set.push(bucket);
        }
    }

    let target_paths: HashSet<&camino::Utf8PathBuf> = target.iter().map(|e| &e.path).collect();
    plan.obsolete_set = inventory
        .paths_present
        .iter()
        .filter(|p| !target_paths.contains(p))
        .cloned()
        .collect();

    plan.new_set.sort_by(|a, b| a.hash.cmp(&b.hash));
    plan.hold_set.sort_by(|a, b| a.hash.cmp(&b.hash));
    plan.obsolete_set.sort();
    plan
}

/// Build a [`StandbyInventory`] by walking `root` and hashing every regular
/// file found; used when resuming a rebuild against a standby slot that
/// already has partial content from a previous attempt.
pub fn scan_standby(root: &Path) -> std::io::Result<StandbyInventory> {
    let mut inventory = StandbyInventory::empty();
    if !root.exists() {
        return Ok(inventory);
    }
    for entry in walk_regular_files(root)? {
        let rel = entry
            .strip_prefix(root)
            .expect("walked entry is under root")
            .to_string_lossy()
            .into_owned();
        let path = camino::Utf8PathBuf::from(format!("/{rel}"));
        if let Ok(hash) = hash_file(&entry) {
            inventory.hashes_present.insert(hash);
        }
        inventory.paths_present.insert(path);
    }
    Ok(inventory)
}

fn walk_regular_files(root: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                out.push(path);
            }
        }
    }
    Ok(out)
}

fn hash_file(path: &Path) -> std::io::Result<Sha256> {
    use sha2::{Digest, Sha256 as Sha256Hasher};
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256Hasher::new();
    hasher.update(&bytes);
    let digest: [u8; 32] = hasher.finalize().into();
    Ok(Sha256(digest))
}
