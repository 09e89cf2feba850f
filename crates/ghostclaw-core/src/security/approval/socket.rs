use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ApprovalDecision, ApprovalRequest};
use crate::error::{Error, Result};
use crate::security::path_policy::expand_path;

fn sanitize_protocol_token(value: &str) -> String {
    value
        .chars()
        .map(|c| if c == '\t' || c == '\n' || c == '\r' { ' ' } else { c })
        .collect()
}

/// Connects to a running `ApprovalSocketServer` and blocks (async) until a
/// decision arrives or the request's timeout elapses. Any failure —
/// connect error, malformed response, or timeout — is surfaced as an
/// error; callers must fail closed.
pub struct ApprovalSocketClient {
    socket_path: PathBuf,
}

impl ApprovalSocketClient {
    pub fn new(socket_path: impl AsRef<str>) -> Self {
        Self {
            socket_path: PathBuf::from(expand_path(socket_path.as_ref())),
        }
    }

    pub async fn request(&self, request: &ApprovalRequest) -> Result<ApprovalDecision> {
        let command = sanitize_protocol_token(request.command.trim());
        if command.is_empty() {
            return Err(Error::ApprovalDenied(
                "approval request command is empty".to_string(),
            ));
        }

        let line = format!(
            "REQUEST\t{}\t{}\t{}\n",
            request.timeout.as_secs(),
            sanitize_protocol_token(&request.session_id),
            command
        );

        let result = tokio::time::timeout(request.timeout, async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| Error::ApprovalDenied(format!("failed to connect to approval socket: {e}")))?;
            stream
                .write_all(line.as_bytes())
                .await
                .map_err(|e| Error::ApprovalDenied(format!("failed to send approval request: {e}")))?;

            let mut buf = Vec::with_capacity(64);
            let mut chunk = [0u8; 256];
            loop {
                let n = stream
                    .read(&mut chunk)
                    .await
                    .map_err(|e| Error::ApprovalDenied(format!("approval socket read failed: {e}")))?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.contains(&b'\n') {
                    break;
                }
            }
            Ok::<Vec<u8>, Error>(buf)
        })
        .await;

        let buf = match result {
            Ok(inner) => inner?,
            Err(_) => return Err(Error::ApprovalDenied("approval request timed out".to_string())),
        };

        let text = String::from_utf8_lossy(&buf);
        let line = text.lines().next().unwrap_or("").trim();
        if line.is_empty() {
            return Err(Error::ApprovalDenied("approval request timed out".to_string()));
        }

        let prefix = "DECISION\t";
        if !line.starts_with(prefix) {
            return Err(Error::ApprovalDenied(
                "approval socket returned malformed response".to_string(),
            ));
        }

        ApprovalDecision::from_str_loose(&line[prefix.len()..]).map_err(Error::ApprovalDenied)
    }
}

/// Handles one incoming approval request on the server side; implementors
/// typically prompt a human and return their choice.
pub trait ApprovalHandler: Send + Sync {
    fn handle(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

impl<F> ApprovalHandler for F
where
    F: Fn(&ApprovalRequest) -> ApprovalDecision + Send + Sync,
{
    fn handle(&self, request: &ApprovalRequest) -> ApprovalDecision {
        self(request)
    }
}

/// Accepts approval requests over a Unix domain socket and dispatches them
/// to a handler. One connection per request: read until newline, respond,
/// close.
pub struct ApprovalSocketServer {
    socket_path: PathBuf,
    handler: Arc<dyn ApprovalHandler>,
    running: Arc<AtomicBool>,
    join: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ApprovalSocketServer {
    pub fn new(socket_path: impl AsRef<str>, handler: Arc<dyn ApprovalHandler>) -> Self {
        Self {
            socket_path: PathBuf::from(expand_path(socket_path.as_ref())),
            handler,
            running: Arc::new(AtomicBool::new(false)),
            join: AsyncMutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;

        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(Error::SandboxRuntimeUnavailable(format!(
                    "failed to bind approval socket: {e}"
                )));
            }
        };

        let handler = Arc::clone(&self.handler);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        if running.load(Ordering::SeqCst) {
                            warn!(error = %e, "approval socket accept failed");
                            continue;
                        }
                        break;
                    }
                };

                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let mut buf = Vec::with_capacity(256);
                    let mut chunk = [0u8; 256];
                    loop {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                buf.extend_from_slice(&chunk[..n]);
                                if buf.contains(&b'\n') {
                                    break;
                                }
                            }
                        }
                    }

                    let text = String::from_utf8_lossy(&buf);
                    let trimmed = text.lines().next().unwrap_or("").trim();
                    let mut decision = ApprovalDecision::Deny;

                    if !trimmed.is_empty() {
                        let fields: Vec<&str> = trimmed.split('\t').collect();
                        if fields.len() >= 4 && fields[0].trim().to_lowercase() == "request" {
                            let timeout_secs: u64 = fields[1].parse().unwrap_or(120);
                            let request = ApprovalRequest {
                                command: fields[3].to_string(),
                                session_id: fields[2].to_string(),
                                timeout: std::time::Duration::from_secs(timeout_secs),
                            };
                            decision = handler.handle(&request);
                            debug!(command = %request.command, decision = decision.as_str(), "approval decision");
                        }
                    }

                    let response = format!("DECISION\t{}\n", decision.as_str());
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        *self.join.lock().await = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // Connecting once unblocks the accept() loop so it observes `running == false`.
        let _ = UnixStream::connect(&self.socket_path).await;
        if let Some(handle) = self.join.lock().await.take() {
            let _ = handle.await;
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct AlwaysAllow;
    impl ApprovalHandler for AlwaysAllow {
        fn handle(&self, _request: &ApprovalRequest) -> ApprovalDecision {
            ApprovalDecision::AllowOnce
        }
    }

    #[tokio::test]
    async fn client_round_trips_with_server() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("approvals.sock");
        let socket_str = socket_path.to_string_lossy().to_string();

        let server = ApprovalSocketServer::new(&socket_str, Arc::new(AlwaysAllow));
        server.start().await.unwrap();

        let client = ApprovalSocketClient::new(&socket_str);
        let request = ApprovalRequest {
            command: "ls -la".to_string(),
            session_id: "s1".to_string(),
            timeout: std::time::Duration::from_secs(2),
        };
        let decision = client.request(&request).await.unwrap();
        assert_eq!(decision, ApprovalDecision::AllowOnce);

        server.stop().await;
    }

    #[tokio::test]
    async fn client_fails_closed_when_nothing_is_listening() {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("missing.sock");
        let client = ApprovalSocketClient::new(&socket_path.to_string_lossy().to_string());
        let request = ApprovalRequest {
            command: "ls".to_string(),
            session_id: "s1".to_string(),
            timeout: std::time::Duration::from_millis(200),
        };
        assert!(client.request(&request).await.is_err());
    }
}
