//! Participant-side stub for the coordination server.
//!
//! Each container holds one `Client` carrying its participant ID and the
//! socket path. The stub registers on connect, forwards captured output and
//! the final wait status, and polls the run-state oracle until cleared to
//! proceed. Polling is deliberate: there are no long-lived server-to-client
//! channels, no ordering coupling across participants, and clean behavior
//! when either side restarts.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

use super::protocol::{
    ErrorCode, ExitRequest, RegisterRequest, RunState, RunnerRequest, RunnerResponse,
    StatusRequest, WaitStatus, WriteLogsRequest, is_sidecar,
};

/// Interval between run-state polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Errors surfaced by the client stub, distinguishable by kind.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live connection; `connect` has not been called or failed.
    #[error("client not connected")]
    NotConnected,

    /// The runner closed the connection.
    #[error("connection closed by runner")]
    ConnectionClosed,

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// The response could not be decoded.
    #[error("decoding response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The runner rejected the request.
    #[error("runner error ({code:?}): {message}")]
    Runner { code: ErrorCode, message: String },

    /// The runner answered with the wrong response variant.
    #[error("unexpected response to {op}")]
    Unexpected { op: &'static str },
}

impl ClientError {
    /// Whether this error means the runner has shut down.
    ///
    /// A closed or broken connection counts: once the runner is gone the
    /// distinction no longer matters to a participant awaiting teardown.
    pub fn is_shutdown(&self) -> bool {
        match self {
            Self::Runner {
                code: ErrorCode::Shutdown,
                ..
            } => true,
            Self::ConnectionClosed => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Client stub for one participant.
pub struct Client {
    id: u32,
    socket_path: PathBuf,
    conn: Option<Connection>,
}

impl Client {
    /// Create a stub for the given participant ID and socket path.
    pub fn new(id: u32, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            socket_path: socket_path.into(),
            conn: None,
        }
    }

    /// This participant's ID.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The socket path this stub dials.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Whether this participant is an auxiliary sidecar.
    pub fn is_sidecar(&self) -> bool {
        is_sidecar(self.id)
    }

    /// Dial the socket and register. Returns the access token.
    ///
    /// Any transport error here is terminal for this stub.
    pub async fn connect(&mut self) -> Result<String, ClientError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (reader, writer) = stream.into_split();
        self.conn = Some(Connection {
            reader: BufReader::new(reader),
            writer,
        });

        let req = RunnerRequest::Register(RegisterRequest { id: self.id });
        match self.call(&req).await? {
            RunnerResponse::Registered(r) => Ok(r.access_token),
            _ => Err(ClientError::Unexpected { op: "register" }),
        }
    }

    /// Forward captured output bytes to the runner's log sink.
    ///
    /// Sidecar output is silently discarded: the full byte count is
    /// reported but no RPC is made. Only checkout and command logs are
    /// captured.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, ClientError> {
        if self.conn.is_none() {
            return Err(ClientError::NotConnected);
        }
        if self.is_sidecar() {
            return Ok(buf.len());
        }
        let req = RunnerRequest::WriteLogs(WriteLogsRequest {
            data_base64: base64::engine::general_purpose::STANDARD.encode(buf),
        });
        match self.call(&req).await? {
            RunnerResponse::Ok => Ok(buf.len()),
            _ => Err(ClientError::Unexpected { op: "write_logs" }),
        }
    }

    /// Report this participant's final wait status. Called exactly once per
    /// process lifetime on normal termination.
    pub async fn exit(&mut self, status: WaitStatus) -> Result<(), ClientError> {
        let req = RunnerRequest::Exit(ExitRequest {
            id: self.id,
            status,
        });
        match self.call(&req).await? {
            RunnerResponse::Ok => Ok(()),
            _ => Err(ClientError::Unexpected { op: "exit" }),
        }
    }

    /// Poll the run-state oracle once.
    pub async fn status(&mut self) -> Result<RunState, ClientError> {
        let req = RunnerRequest::Status(StatusRequest { id: self.id });
        match self.call(&req).await? {
            RunnerResponse::Status(s) => Ok(s.state),
            _ => Err(ClientError::Unexpected { op: "status" }),
        }
    }

    /// Poll until the oracle returns `desired`.
    ///
    /// A shutdown error while awaiting [`RunState::Interrupt`] counts as
    /// success: the runner going away is an acceptable way to satisfy a
    /// stop request. Any other error is returned.
    pub async fn await_run_state(&mut self, desired: RunState) -> Result<(), ClientError> {
        loop {
            match self.status().await {
                Ok(state) if state == desired => return Ok(()),
                Ok(_) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(err) if desired == RunState::Interrupt && err.is_shutdown() => {
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Release the transport handle.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.writer.shutdown().await;
        }
    }

    async fn call(&mut self, req: &RunnerRequest) -> Result<RunnerResponse, ClientError> {
        let conn = self.conn.as_mut().ok_or(ClientError::NotConnected)?;

        let mut json = serde_json::to_string(req)?;
        json.push('\n');
        conn.writer.write_all(json.as_bytes()).await?;

        let mut line = String::new();
        let n = conn.reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        match serde_json::from_str::<RunnerResponse>(&line)? {
            RunnerResponse::Error(e) => Err(ClientError::Runner {
                code: e.code,
                message: e.message,
            }),
            resp => Ok(resp),
        }
    }
}
