//! Minimal JSON-lines-over-Unix-socket RPC front end, for callers that
//! would rather keep one long-lived client process than spawn the CLI per
//! request. One newline-delimited JSON request in, one newline-delimited
//! JSON response out, per connection.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use crate::cert::CertStore;
use crate::client::OtaClient;
use crate::config::Config;
use crate::error::FailureKind;

/// One request accepted over the RPC socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    /// Fetch, verify, and apply an update.
    Update {
        manifest_url: String,
        image_base_url: String,
        cert_pem_base64: String,
    },
    /// Roll back to the previously active slot.
    Rollback,
    /// Report current status.
    Status,
}

/// One response sent back over the RPC socket.
#[derive(Debug, Serialize)]
struct Response {
    kind: FailureKind,
    detail: String,
}

/// Listen on `socket_path`, serving one [`Request`]/[`Response`] pair per
/// line per connection until the process is killed.
pub async fn serve(socket_path: String) -> Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path).with_context(|| format!("binding {socket_path}"))?;
    tracing::info!(socket = %socket_path, "daemon listening");

    let config = Config::load(&"/etc/ota/config.toml".into()).unwrap_or_default();
    let verifier = Arc::new(CertStore::new("/etc/ota/certs"));
    let client = Arc::new(OtaClient::new(config, verifier));

    loop {
        let (stream, _addr) = listener.accept().await.context("accepting connection")?;
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client).await {
                tracing::warn!(error = %e, "daemon connection ended with an error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, client: Arc<OtaClient>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(&client, request).await,
            Err(e) => Response {
                kind: FailureKind::Recoverable,
                detail: format!("malformed request: {e}"),
            },
        };
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}

async fn dispatch(client: &OtaClient, request: Request) -> Response {
    match request {
        Request::Update {
            manifest_url,
            image_base_url,
            cert_pem_base64,
        } => {
            use base64::Engine;
            let cert_pem = match base64::engine::general_purpose::STANDARD.decode(cert_pem_base64) {
                Ok(b) => b,
                Err(e) => {
                    return Response {
                        kind: FailureKind::Recoverable,
                        detail: format!("invalid cert_pem_base64: {e}"),
                    }
                }
            };
            let resp = match reqwest::get(&manifest_url).await {
                Ok(r) => r,
                Err(e) => {
                    return Response {
                        kind: FailureKind::Recoverable,
                        detail: format!("fetching manifest: {e}"),
                    }
                }
            };
            let manifest_jwt = match resp.text().await {
                Ok(t) => t,
                Err(e) => {
                    return Response {
                        kind: FailureKind::Recoverable,
                        detail: format!("reading manifest body: {e}"),
                    }
                }
            };
            match client.update(&manifest_url, &manifest_jwt, &cert_pem, &image_base_url).await {
                Ok(()) => Response {
                    kind: FailureKind::NoFailure,
                    detail: "update applied".into(),
                },
                Err(e) => Response {
                    kind: e.kind(),
                    detail: e.to_string(),
                },
            }
        }
        Request::Rollback => match client.rollback().await {
            Ok(()) => Response {
                kind: FailureKind::NoFailure,
                detail: "rolled back".into(),
            },
            Err(e) => Response {
                kind: e.kind(),
                detail: e.to_string(),
            },
        },
        Request::Status => {
            let status = client.status().await;
            Response {
                kind: FailureKind::NoFailure,
                detail: format!("busy={} phase={:?}", status.busy, status.phase),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_request_parses() {
        let req: Request = serde_json::from_str(r#"{"op":"status"}"#).unwrap();
        assert!(matches!(req, Request::Status));
    }

    #[test]
    fn rollback_request_parses() {
        let req: Request = serde_json::from_str(r#"{"op":"rollback"}"#).unwrap();
        assert!(matches!(req, Request::Rollback));
    }

    #[test]
    fn update_request_parses() {
        let req: Request = serde_json::from_str(
            r#"{"op":"update","manifest_url":"http://x/m","image_base_url":"http://x/i","cert_pem_base64":""}"#,
        )
        .unwrap();
        assert!(matches!(req, Request::Update { .. }));
    }
}
