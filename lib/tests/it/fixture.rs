//! Shared scaffolding for the end-to-end tests in `main.rs`: a minimal
//! hand-rolled HTTP/1.1 file server (standing in for the image/manifest
//! host) plus helpers for building a signed-envelope-shaped manifest JWT and
//! a `Config` rooted entirely under a tempdir.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use camino::Utf8PathBuf;
use otaclient_lib::cert::Verifier;
use otaclient_lib::config::{BootloaderFamily, Config};
use otaclient_lib::manifest::ManifestEnvelope;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// A verifier that accepts every envelope, standing in for the real
/// certificate-chain check these tests don't exercise.
#[derive(Debug)]
pub struct AlwaysOk;

impl Verifier for AlwaysOk {
    fn verify(&self, _envelope: &ManifestEnvelope, _cert_pem: &[u8]) -> otaclient_lib::error::Result<()> {
        Ok(())
    }
}

/// An in-process HTTP/1.1 server, keyed by exact request path, serving
/// canned byte blobs with a plain `Content-Length` response (no chunked
/// encoding). Stands in for the image host and caching proxy these tests
/// have no real network access to.
pub struct TestServer {
    base_url: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl TestServer {
    /// Bind an ephemeral local port and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let files: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
        let accept_files = files.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(serve_one(stream, accept_files.clone()));
            }
        });
        Self {
            base_url: format!("http://{addr}"),
            files,
        }
    }

    /// Register a response body for `path` (leading `/` optional).
    pub fn serve(&self, path: &str, body: impl Into<Vec<u8>>) {
        self.files.lock().unwrap().insert(path.trim_start_matches('/').to_string(), body.into());
    }

    /// The server's base URL, e.g. `http://127.0.0.1:54321`.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

async fn serve_one(stream: tokio::net::TcpStream, files: Arc<Mutex<HashMap<String, Vec<u8>>>>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut request_line = String::new();
    if matches!(reader.read_line(&mut request_line).await, Ok(0) | Err(_)) {
        return;
    }
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) if line == "\r\n" || line == "\n" => break,
            Ok(_) => continue,
        }
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .trim_start_matches('/')
        .to_string();
    let body = files.lock().unwrap().get(&path).cloned();
    let response = match body {
        Some(bytes) => {
            let mut head =
                format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", bytes.len()).into_bytes();
            head.extend_from_slice(&bytes);
            head
        }
        None => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
    };
    let _ = writer.write_all(&response).await;
    let _ = writer.shutdown().await;
}

/// Hex-encoded sha256 of `bytes`, for `StreamRef.hash` fixtures.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Assemble a `header.payload.signature` string whose payload decodes to the
/// given JSON value. The header and signature are arbitrary opaque bytes;
/// [`AlwaysOk`] never inspects them.
pub fn build_manifest_jwt(payload: serde_json::Value) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(b"test-header");
    let payload_bytes = serde_json::to_vec(&vec![payload]).expect("serialize manifest payload");
    let payload_b64 = engine.encode(payload_bytes);
    let signature = engine.encode(b"test-signature");
    format!("{header}.{payload_b64}.{signature}")
}

/// Build the JSON payload section naming the four meta-stream bodies
/// already registered on `server` under their conventional filenames.
pub fn manifest_payload_json(
    dirs_text: &str,
    symlinks_text: &str,
    regulars_text: &str,
    persistents_text: &str,
    compressed_rootfs: bool,
) -> serde_json::Value {
    serde_json::json!({
        "version": 1,
        "directory": {"file": "dirs.txt", "hash": sha256_hex(dirs_text.as_bytes())},
        "symboliclink": {"file": "symlinks.txt", "hash": sha256_hex(symlinks_text.as_bytes())},
        "regular": {"file": "regulars.txt", "hash": sha256_hex(regulars_text.as_bytes())},
        "persistent": {"file": "persistents.txt", "hash": sha256_hex(persistents_text.as_bytes())},
        "rootfs_directory": "rootfs",
        "certificate": {"file": "leaf.pem", "hash": ""},
        "compressed_rootfs": compressed_rootfs,
    })
}

/// A `Config` with every filesystem path rooted under `root` (a tempdir) and
/// the no-op bootloader adapter, so a test never touches the real `/boot`.
pub fn test_config(root: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.bootloader = BootloaderFamily::Noop;
    config.paths.standby_mount = utf8(root.join("standby"));
    config.paths.active_root = utf8(root.join("active"));
    config.paths.tmp_pool = utf8(root.join("tmp"));
    config.paths.ota_status_dir = utf8(root.join("ota-status"));
    config.paths.boot_dir = utf8(root.join("boot"));
    std::fs::create_dir_all(root.join("standby")).unwrap();
    std::fs::create_dir_all(root.join("active")).unwrap();
    std::fs::create_dir_all(root.join("tmp")).unwrap();
    std::fs::create_dir_all(root.join("ota-status")).unwrap();
    std::fs::create_dir_all(root.join("boot")).unwrap();
    config
}

fn utf8(p: std::path::PathBuf) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(p).expect("tempdir path is valid UTF-8")
}
