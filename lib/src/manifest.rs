//! Manifest parsing: entry types and the four meta-stream grammars.
//!
//! See spec.md §3 (data model) and §4.A (component design). Each
//! meta-stream is a newline-delimited text stream; every line is matched
//! against a fixed regex grammar. A line that doesn't match is an
//! unrecoverable failure for the whole update — a partially-applied image
//! is forbidden, so the parser never silently skips a bad line.

use std::fmt;
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{OtaError, Result};

static RE_DIRECTORY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<mode>[0-7]+),(?P<uid>\d+),(?P<gid>\d+),'(?P<path>.*)'$").unwrap()
});
static RE_SYMLINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<mode>[0-7]+),(?P<uid>\d+),(?P<gid>\d+),'(?P<link>(?:[^']|'\\'')*)','(?P<target>(?:[^']|'\\'')*)'$").unwrap()
});
static RE_REGULAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<mode>[0-7]+),(?P<uid>\d+),(?P<gid>\d+),(?P<nlink>\d+),(?P<hash>[0-9a-fA-F]+),'(?P<path>(?:[^']|'\\'')*)'(?:,(?P<size>\d+)(?:,(?P<inode>\d+))?)?$").unwrap()
});

/// Unescape `'\''` back to `'` inside a quoted manifest path field.
pub fn unescape_quote(s: &str) -> String {
    s.replace("'\\''", "'")
}

/// Escape `'` as `'\''` for a path field destined for a quoted manifest line.
pub fn escape_quote(s: &str) -> String {
    s.replace('\'', "'\\''")
}

/// A 32-byte sha256 content digest, stored and compared as raw bytes but
/// displayed/parsed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sha256(#[serde(with = "hex::serde")] pub [u8; 32]);

impl fmt::Debug for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256({})", hex::encode(self.0))
    }
}

impl fmt::Display for Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Sha256 {
    /// Parse a lowercase- or uppercase-hex sha256 digest.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| OtaError::MalformedManifest {
            stream: "regulars.txt".into(),
            line: 0,
            detail: format!("invalid hash {s:?}: {e}"),
        })?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| OtaError::MalformedManifest {
            stream: "regulars.txt".into(),
            line: 0,
            detail: format!("hash {s:?} is not 32 bytes"),
        })?;
        Ok(Self(arr))
    }
}

/// A single entry from `regulars.txt`.
///
/// Invariant: if `inode` is present, `size` must be present. Entries
/// sharing an `inode` form a hardlink group and must share `sha256`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegularEntry {
    /// Octal permission bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Number of hardlinks sharing this content; always >= 1.
    pub nlink: u32,
    /// Content digest.
    pub sha256: Sha256,
    /// Absolute path, rooted at `/`.
    pub path: Utf8PathBuf,
    /// Size in bytes, if the manifest carried it.
    pub size: Option<u64>,
    /// Inode tag grouping hardlinked entries, if the manifest carried it.
    pub inode: Option<u64>,
    /// Whether the remote payload for this entry is pre-compressed (zstd).
    pub compressed: bool,
}

impl RegularEntry {
    /// The group identifier hardlink siblings share: the inode tag if
    /// present, else the content hash.
    pub fn group_id(&self) -> String {
        match self.inode {
            Some(i) => format!("i:{i}"),
            None => format!("h:{}", self.sha256),
        }
    }

    /// Whether this entry's path must be routed to the boot directory
    /// rather than the standby rootfs mount point.
    pub fn targets_boot(&self) -> bool {
        self.path.as_str().starts_with("/boot/")
    }

    fn parse(line: &str, lineno: usize) -> Result<Self> {
        let caps = RE_REGULAR.captures(line).ok_or_else(|| OtaError::MalformedManifest {
            stream: "regulars.txt".into(),
            line: lineno,
            detail: format!("line does not match regular-entry grammar: {line:?}"),
        })?;
        let mode = u32::from_str_radix(&caps["mode"], 8).map_err(|e| malformed("regulars.txt", lineno, e))?;
        let uid = caps["uid"].parse().map_err(|e| malformed("regulars.txt", lineno, e))?;
        let gid = caps["gid"].parse().map_err(|e| malformed("regulars.txt", lineno, e))?;
        let nlink: u32 = caps["nlink"].parse().map_err(|e| malformed("regulars.txt", lineno, e))?;
        if nlink < 1 {
            return Err(OtaError::MalformedManifest {
                stream: "regulars.txt".into(),
                line: lineno,
                detail: "nlink must be >= 1".into(),
            });
        }
        let sha256 = Sha256::parse(&caps["hash"])?;
        let path = Utf8PathBuf::from(unescape_quote(&caps["path"]));
        let size = caps.name("size").map(|m| m.as_str().parse()).transpose().map_err(|e| malformed("regulars.txt", lineno, e))?;
        let inode = caps.name("inode").map(|m| m.as_str().parse()).transpose().map_err(|e| malformed("regulars.txt", lineno, e))?;
        if inode.is_some() && size.is_none() {
            return Err(OtaError::MalformedManifest {
                stream: "regulars.txt".into(),
                line: lineno,
                detail: "inode present without size".into(),
            });
        }
        Ok(Self {
            mode,
            uid,
            gid,
            nlink,
            sha256,
            path,
            size,
            inode,
            compressed: false,
        })
    }

    /// Serialize back to the `regulars.txt` line format, for the
    /// parse-round-trip invariant in spec.md §8.
    pub fn to_line(&self) -> String {
        let mut s = format!(
            "{:o},{},{},{},{},'{}'",
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.sha256,
            escape_quote(self.path.as_str())
        );
        if let Some(size) = self.size {
            s.push_str(&format!(",{size}"));
            if let Some(inode) = self.inode {
                s.push_str(&format!(",{inode}"));
            }
        }
        s
    }
}

fn malformed(stream: &str, line: usize, e: impl std::fmt::Display) -> OtaError {
    OtaError::MalformedManifest {
        stream: stream.into(),
        line,
        detail: e.to_string(),
    }
}

/// A single entry from `dirs.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Octal permission bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Absolute path, rooted at `/`.
    pub path: Utf8PathBuf,
}

impl DirectoryEntry {
    fn parse(line: &str, lineno: usize) -> Result<Self> {
        let caps = RE_DIRECTORY.captures(line).ok_or_else(|| OtaError::MalformedManifest {
            stream: "dirs.txt".into(),
            line: lineno,
            detail: format!("line does not match directory-entry grammar: {line:?}"),
        })?;
        Ok(Self {
            mode: u32::from_str_radix(&caps["mode"], 8).map_err(|e| malformed("dirs.txt", lineno, e))?,
            uid: caps["uid"].parse().map_err(|e| malformed("dirs.txt", lineno, e))?,
            gid: caps["gid"].parse().map_err(|e| malformed("dirs.txt", lineno, e))?,
            path: Utf8PathBuf::from(unescape_quote(&caps["path"])),
        })
    }

    /// Serialize back to the `dirs.txt` line format.
    pub fn to_line(&self) -> String {
        format!("{:o},{},{},'{}'", self.mode, self.uid, self.gid, escape_quote(self.path.as_str()))
    }
}

/// A single entry from `symlinks.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkEntry {
    /// Permission bits; symlinks have no real permission bits on Linux but
    /// the manifest still carries a value for uniformity.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Path at which the symlink itself is created.
    pub linkpath: Utf8PathBuf,
    /// Target the symlink points at.
    pub target: Utf8PathBuf,
}

impl SymlinkEntry {
    fn parse(line: &str, lineno: usize) -> Result<Self> {
        let caps = RE_SYMLINK.captures(line).ok_or_else(|| OtaError::MalformedManifest {
            stream: "symlinks.txt".into(),
            line: lineno,
            detail: format!("line does not match symlink-entry grammar: {line:?}"),
        })?;
        Ok(Self {
            mode: u32::from_str_radix(&caps["mode"], 8).map_err(|e| malformed("symlinks.txt", lineno, e))?,
            uid: caps["uid"].parse().map_err(|e| malformed("symlinks.txt", lineno, e))?,
            gid: caps["gid"].parse().map_err(|e| malformed("symlinks.txt", lineno, e))?,
            linkpath: Utf8PathBuf::from(unescape_quote(&caps["link"])),
            target: Utf8PathBuf::from(unescape_quote(&caps["target"])),
        })
    }

    /// Serialize back to the `symlinks.txt` line format.
    pub fn to_line(&self) -> String {
        format!(
            "{:o},{},{},'{}','{}'",
            self.mode,
            self.uid,
            self.gid,
            escape_quote(self.linkpath.as_str()),
            escape_quote(self.target.as_str())
        )
    }
}

/// A single entry from `persistents.txt`: a path to carry over verbatim
/// from the active slot, never resolved against the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentEntry {
    /// Absolute path on the live rootfs to copy to the same location on standby.
    pub path: Utf8PathBuf,
}

impl PersistentEntry {
    fn parse(line: &str, lineno: usize) -> Result<Self> {
        let line = line.trim();
        if line.len() < 2 || !line.starts_with('\'') || !line.ends_with('\'') {
            return Err(OtaError::MalformedManifest {
                stream: "persistents.txt".into(),
                line: lineno,
                detail: format!("expected a quoted path: {line:?}"),
            });
        }
        let inner = &line[1..line.len() - 1];
        Ok(Self {
            path: Utf8PathBuf::from(unescape_quote(inner)),
        })
    }

    /// Serialize back to the `persistents.txt` line format.
    pub fn to_line(&self) -> String {
        format!("'{}'", escape_quote(self.path.as_str()))
    }
}

/// Parse a whole newline-delimited meta-stream into a `Vec` of typed
/// entries, eagerly. The builder consumes each stream exactly once; eager
/// parsing here keeps callers simple while still failing the whole update
/// on the first malformed line, since a partial image is never acceptable.
pub fn parse_stream<T>(
    stream_name: &str,
    text: &str,
    parse_line: impl Fn(&str, usize) -> Result<T>,
) -> Result<Vec<T>> {
    let _ = stream_name;
    text.lines()
        .enumerate()
        .filter(|(_, l)| !l.is_empty())
        .map(|(i, l)| parse_line(l, i + 1))
        .collect()
}

/// Parse `dirs.txt`.
pub fn parse_directories(text: &str) -> Result<Vec<DirectoryEntry>> {
    parse_stream("dirs.txt", text, DirectoryEntry::parse)
}

/// Parse `symlinks.txt`.
pub fn parse_symlinks(text: &str) -> Result<Vec<SymlinkEntry>> {
    parse_stream("symlinks.txt", text, SymlinkEntry::parse)
}

/// Parse `regulars.txt`.
pub fn parse_regulars(text: &str) -> Result<Vec<RegularEntry>> {
    parse_stream("regulars.txt", text, RegularEntry::parse)
}

/// Parse `persistents.txt`.
pub fn parse_persistents(text: &str) -> Result<Vec<PersistentEntry>> {
    parse_stream("persistents.txt", text, PersistentEntry::parse)
}

/// A `{ file, hash }` reference to an auxiliary meta-stream file, as carried
/// in the manifest envelope's JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRef {
    /// Filename of the auxiliary stream, relative to the image base directory.
    pub file: String,
    /// Expected sha256 of that file, hex-encoded.
    pub hash: String,
}

/// A certificate descriptor: which certificate (by filename) signs this
/// manifest, with its own content hash for integrity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateDescriptor {
    /// Certificate filename, relative to the image base directory.
    pub file: String,
    /// sha256 of the certificate file, hex-encoded.
    pub hash: String,
}

/// The manifest payload: one entry per meta-stream, plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestPayload {
    /// Manifest format version. Currently `1`; other versions are accepted
    /// best-effort and merely logged.
    pub version: u32,
    /// Reference to `dirs.txt`.
    pub directory: StreamRef,
    /// Reference to `symlinks.txt`.
    pub symboliclink: StreamRef,
    /// Reference to `regulars.txt`.
    pub regular: StreamRef,
    /// Reference to `persistents.txt`.
    pub persistent: StreamRef,
    /// Directory name, relative to the image URL root, holding the rootfs payload.
    pub rootfs_directory: String,
    /// Which certificate signs this manifest.
    pub certificate: CertificateDescriptor,
    /// Total regular-file byte count, if the manifest author supplied it.
    pub total_regular_size: Option<u64>,
    /// Whether the rootfs payload under `rootfs_directory` is stored
    /// zstd-compressed (one `.zst` sibling per regular-file path), rather
    /// than as plain files. Defaults to `false` for manifests that predate
    /// this section.
    #[serde(default)]
    pub compressed_rootfs: bool,
}

/// The signed envelope: `header.payload.signature`, JWT-shaped but not a
/// general JWS implementation — signature *verification* is delegated to
/// [`crate::cert::Verifier`], a thin external contract per spec.md §6.
#[derive(Debug, Clone)]
pub struct ManifestEnvelope {
    /// Raw `header.payload` bytes, exactly as signed.
    pub signed_bytes: Vec<u8>,
    /// Decoded signature bytes.
    pub signature: Vec<u8>,
    /// The decoded JSON payload.
    pub payload: ManifestPayload,
}

impl ManifestEnvelope {
    /// Parse a `header.payload.signature` string. The payload is a JSON
    /// array of single-key objects naming a section; this reassembles them
    /// into [`ManifestPayload`].
    pub fn parse(jwt: &str) -> Result<Self> {
        use base64::Engine;
        let mut parts = jwt.splitn(3, '.');
        let (header_b64, payload_b64, sig_b64) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) => (h, p, s),
            _ => {
                return Err(OtaError::MalformedManifest {
                    stream: "manifest.jwt".into(),
                    line: 0,
                    detail: "expected header.payload.signature".into(),
                })
            }
        };
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let payload_bytes = engine.decode(payload_b64).map_err(|e| malformed("manifest.jwt", 0, e))?;
        let signature = engine.decode(sig_b64).map_err(|e| malformed("manifest.jwt", 0, e))?;
        let sections: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_slice(&payload_bytes).map_err(|e| malformed("manifest.jwt", 0, e))?;
        let payload = Self::assemble(sections)?;
        let signed_bytes = format!("{header_b64}.{payload_b64}").into_bytes();
        Ok(Self {
            signed_bytes,
            signature,
            payload,
        })
    }

    fn assemble(sections: Vec<serde_json::Map<String, serde_json::Value>>) -> Result<ManifestPayload> {
        let mut version = None;
        let mut directory = None;
        let mut symboliclink = None;
        let mut regular = None;
        let mut persistent = None;
        let mut rootfs_directory = None;
        let mut certificate = None;
        let mut total_regular_size = None;
        let mut compressed_rootfs = None;
        for mut section in sections {
            if let Some(v) = section.remove("version") {
                version = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("directory") {
                directory = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("symboliclink") {
                symboliclink = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("regular") {
                regular = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("persistent") {
                persistent = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("rootfs_directory") {
                rootfs_directory = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("certificate") {
                certificate = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("total_regular_size") {
                total_regular_size = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
            if let Some(v) = section.remove("compressed_rootfs") {
                compressed_rootfs = Some(serde_json::from_value(v).map_err(|e| malformed("manifest.jwt", 0, e))?);
            }
        }
        let missing = |what: &str| OtaError::MalformedManifest {
            stream: "manifest.jwt".into(),
            line: 0,
            detail: format!("missing `{what}` section"),
        };
        Ok(ManifestPayload {
            version: version.ok_or_else(|| missing("version"))?,
            directory: directory.ok_or_else(|| missing("directory"))?,
            symboliclink: symboliclink.ok_or_else(|| missing("symboliclink"))?,
            regular: regular.ok_or_else(|| missing("regular"))?,
            persistent: persistent.ok_or_else(|| missing("persistent"))?,
            rootfs_directory: rootfs_directory.ok_or_else(|| missing("rootfs_directory"))?,
            certificate: certificate.ok_or_else(|| missing("certificate"))?,
            total_regular_size,
            compressed_rootfs: compressed_rootfs.unwrap_or(false),
        })
    }
}

/// A fully parsed manifest: the four typed streams plus the envelope metadata.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Format version, as declared by the envelope.
    pub version: u32,
    /// Rootfs base directory name, relative to the image URL root.
    pub rootfs_directory: String,
    /// All directories to create on standby.
    pub directories: Vec<DirectoryEntry>,
    /// All symlinks to create on standby.
    pub symlinks: Vec<SymlinkEntry>,
    /// All regular files in the target rootfs.
    pub regulars: Vec<RegularEntry>,
    /// All paths to carry over from the active slot verbatim.
    pub persistents: Vec<PersistentEntry>,
    /// Declared total regular-file byte count, if present.
    pub total_regular_size: Option<u64>,
}

impl Manifest {
    /// Assemble a [`Manifest`] from an envelope plus the four already-fetched
    /// and hash-verified stream bodies.
    pub fn from_streams(
        envelope: &ManifestEnvelope,
        dirs_text: &str,
        symlinks_text: &str,
        regulars_text: &str,
        persistents_text: &str,
    ) -> Result<Self> {
        if envelope.payload.version != 1 {
            tracing::warn!(
                version = envelope.payload.version,
                "manifest declares a version other than 1; processing best-effort"
            );
        }
        let mut regulars = parse_regulars(regulars_text)?;
        if envelope.payload.compressed_rootfs {
            for entry in &mut regulars {
                entry.compressed = true;
            }
        }
        Ok(Self {
            version: envelope.payload.version,
            rootfs_directory: envelope.payload.rootfs_directory.clone(),
            directories: parse_directories(dirs_text)?,
            symlinks: parse_symlinks(symlinks_text)?,
            regulars,
            persistents: parse_persistents(persistents_text)?,
            total_regular_size: envelope.payload.total_regular_size,
        })
    }
}
