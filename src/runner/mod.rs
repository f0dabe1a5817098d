//! In-workload coordination server.
//!
//! One runner per workload. It owns a unix socket, a fixed-size registry of
//! participant slots, and three fire-once lifecycle latches. Participants
//! connect over the socket, register, poll the run-state oracle until they
//! are cleared to run, stream captured output, and finally report their
//! wait status. When every slot has exited the `done` latch fires and the
//! outer controller collects the aggregated job status.
//!
//! The oracle encodes a three-phase discipline: checkout runs first and
//! alone; sidecars start only after checkout exits; the command starts only
//! once every sidecar has registered; when the command exits, sidecars are
//! told to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub mod client;
pub mod protocol;

use protocol::{
    CHECKOUT_ID, COMMAND_ID, ErrorCode, ErrorResponse, RegisteredResponse, RunState,
    RunnerRequest, RunnerResponse, StatusResponse, WaitStatus,
};

/// Default socket path inside the shared workspace volume.
pub const DEFAULT_SOCKET_PATH: &str = "/workspace/buildkite.sock";

/// Merged byte sink for captured checkout and command output.
pub type LogSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Runner construction inputs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Socket path to listen on. Empty means [`DEFAULT_SOCKET_PATH`].
    pub socket_path: PathBuf,
    /// Number of expected participants; the registry is fixed at this size.
    /// Must be at least 1.
    pub participant_count: usize,
    /// Access token handed back to participants on registration.
    pub access_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SlotState {
    #[default]
    Unknown,
    Connected,
    Exited,
}

/// One registry slot per expected participant.
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    state: SlotState,
    status: WaitStatus,
}

impl Slot {
    fn connected(&self) -> bool {
        matches!(self.state, SlotState::Connected | SlotState::Exited)
    }

    fn exited(&self) -> bool {
        self.state == SlotState::Exited
    }
}

/// The coordination server.
pub struct Runner {
    conf: RunnerConfig,
    slots: Mutex<Vec<Slot>>,
    sink: Mutex<LogSink>,
    started: CancellationToken,
    done: CancellationToken,
    interrupt: CancellationToken,
}

impl Runner {
    /// Create a runner with an empty registry of `participant_count` slots.
    pub fn new(mut conf: RunnerConfig, sink: LogSink) -> Self {
        if conf.socket_path.as_os_str().is_empty() {
            conf.socket_path = PathBuf::from(DEFAULT_SOCKET_PATH);
        }
        let slots = vec![Slot::default(); conf.participant_count];
        Self {
            conf,
            slots: Mutex::new(slots),
            sink: Mutex::new(sink),
            started: CancellationToken::new(),
            done: CancellationToken::new(),
            interrupt: CancellationToken::new(),
        }
    }

    /// Socket path the runner listens on.
    pub fn socket_path(&self) -> &PathBuf {
        &self.conf.socket_path
    }

    /// Latch that fires once the first participant registers.
    pub fn started(&self) -> CancellationToken {
        self.started.clone()
    }

    /// Latch that fires once every slot has exited or [`Runner::terminate`]
    /// is called.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Latch that fires once [`Runner::interrupt`] is called.
    pub fn interrupted(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Signal all participants to stop gracefully. Idempotent.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Force the `done` latch, bypassing the all-exited barrier. Idempotent.
    pub fn terminate(&self) {
        self.done.cancel();
    }

    /// Reduce the registry to the job's overall wait status.
    ///
    /// A non-zero checkout status dominates; otherwise the command's
    /// recorded status is the job status (zero-valued if the command never
    /// exited, or if the registry holds only the checkout slot).
    pub async fn wait_status(&self) -> WaitStatus {
        let slots = self.slots.lock().await;
        let checkout = slots.first().copied().unwrap_or_default();
        if checkout.status.exit_code != 0 {
            return checkout.status;
        }
        slots
            .get(COMMAND_ID as usize)
            .map(|slot| slot.status)
            .unwrap_or(checkout.status)
    }

    /// Serve RPCs on the socket until `done` fires or `shutdown` cancels.
    ///
    /// Cancellation is equivalent to [`Runner::terminate`] for external
    /// observers. The socket file is removed on exit. Idempotent across
    /// `done`: a runner that is already done never re-binds.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        if self.done.is_cancelled() {
            return Ok(());
        }

        let socket_path = self.conf.socket_path.clone();
        if let Some(parent) = socket_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                self.terminate();
                return Err(e).with_context(|| format!("creating socket directory {parent:?}"));
            }
        }

        // A leftover socket file means another runner may own the path;
        // fail fast rather than unlink it. Bind-time failure is fatal for
        // the workload, so release anyone waiting on the latch first.
        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                self.terminate();
                return Err(e)
                    .with_context(|| format!("binding coordination socket {socket_path:?}"));
            }
        };

        info!(
            path = %socket_path.display(),
            participants = self.conf.participant_count,
            "runner listening"
        );

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        debug!("participant connection accepted");
                        let runner = Arc::clone(&self);
                        tokio::spawn(async move {
                            runner.handle_connection(stream).await;
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                },
                _ = self.done.cancelled() => break,
                _ = shutdown.cancelled() => {
                    self.terminate();
                    break;
                }
            }
        }

        drop(listener);
        let _ = tokio::fs::remove_file(&socket_path).await;
        debug!("runner done");
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("participant disconnected");
                    break;
                }
                Ok(_) => {
                    let resp = match serde_json::from_str::<RunnerRequest>(&line) {
                        Ok(req) => self.handle_request(req).await,
                        Err(e) => error_response(
                            ErrorCode::InvalidRequest,
                            format!("invalid request: {e}"),
                        ),
                    };
                    let mut json = serde_json::to_string(&resp).unwrap();
                    json.push('\n');
                    if let Err(e) = writer.write_all(json.as_bytes()).await {
                        error!("writing response: {e}");
                        break;
                    }
                }
                Err(e) => {
                    error!("reading request: {e}");
                    break;
                }
            }
        }
    }

    async fn handle_request(&self, req: RunnerRequest) -> RunnerResponse {
        match req {
            RunnerRequest::Register(r) => self.register(r.id).await,
            RunnerRequest::Exit(r) => self.exit(r.id, r.status).await,
            RunnerRequest::WriteLogs(r) => self.write_logs(&r.data_base64).await,
            RunnerRequest::Status(r) => self.status(r.id).await,
        }
    }

    /// Mark the slot connected and hand back the access token. Fires the
    /// `started` latch on the first successful registration.
    pub async fn register(&self, id: u32) -> RunnerResponse {
        if self.done.is_cancelled() {
            return shutdown_response();
        }
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(id as usize) else {
            return error_response(
                ErrorCode::UnknownParticipant,
                format!("participant id {id} not found"),
            );
        };
        if slot.connected() {
            return error_response(
                ErrorCode::DuplicateRegistration,
                format!("participant id {id} already registered"),
            );
        }
        slot.state = SlotState::Connected;
        self.started.cancel();
        info!(id, "participant connected");
        RunnerResponse::Registered(RegisteredResponse {
            access_token: self.conf.access_token.clone(),
        })
    }

    /// Record the slot's wait status and mark it exited. Fires the `done`
    /// latch once every slot has exited.
    pub async fn exit(&self, id: u32, status: WaitStatus) -> RunnerResponse {
        if self.done.is_cancelled() {
            return shutdown_response();
        }
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(id as usize) else {
            return error_response(
                ErrorCode::UnknownParticipant,
                format!("participant id {id} not found"),
            );
        };
        info!(id, code = status.exit_code, "participant exited");
        slot.status = status;
        slot.state = SlotState::Exited;

        if slots.iter().all(Slot::exited) {
            self.done.cancel();
        }
        RunnerResponse::Ok
    }

    /// Evaluate the run-state oracle for the given participant.
    pub async fn status(&self, id: u32) -> RunnerResponse {
        if self.done.is_cancelled() {
            return shutdown_response();
        }
        let slots = self.slots.lock().await;
        if id as usize >= slots.len() {
            return error_response(
                ErrorCode::UnknownParticipant,
                format!("participant id {id} not found"),
            );
        }

        let state = if self.interrupt.is_cancelled() {
            RunState::Interrupt
        } else {
            match id {
                CHECKOUT_ID => RunState::Go,
                COMMAND_ID => {
                    let checkout_exited = slots[CHECKOUT_ID as usize].exited();
                    let sidecars_ready = slots.iter().skip(2).all(Slot::connected);
                    if checkout_exited && sidecars_ready {
                        RunState::Go
                    } else {
                        RunState::Wait
                    }
                }
                _ => {
                    // Sidecars tear down once the command finishes.
                    if slots
                        .get(COMMAND_ID as usize)
                        .is_some_and(|slot| slot.exited())
                    {
                        RunState::Interrupt
                    } else if slots[CHECKOUT_ID as usize].exited() {
                        RunState::Go
                    } else {
                        RunState::Wait
                    }
                }
            }
        };
        debug!(id, state = %state, "status poll");
        RunnerResponse::Status(StatusResponse { state })
    }

    /// Append a base64-encoded byte buffer to the log sink, best effort.
    pub async fn write_logs(&self, data_base64: &str) -> RunnerResponse {
        if self.done.is_cancelled() {
            return shutdown_response();
        }
        let data = match base64::engine::general_purpose::STANDARD.decode(data_base64) {
            Ok(data) => data,
            Err(e) => {
                return error_response(
                    ErrorCode::InvalidRequest,
                    format!("invalid base64 log payload: {e}"),
                );
            }
        };
        // The registry lock is not held here; the sink serializes itself.
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.write_all(&data).await {
            return error_response(ErrorCode::SinkWrite, format!("writing log sink: {e}"));
        }
        if let Err(e) = sink.flush().await {
            return error_response(ErrorCode::SinkWrite, format!("flushing log sink: {e}"));
        }
        RunnerResponse::Ok
    }
}

fn error_response(code: ErrorCode, message: impl Into<String>) -> RunnerResponse {
    RunnerResponse::Error(ErrorResponse {
        code,
        message: message.into(),
    })
}

fn shutdown_response() -> RunnerResponse {
    error_response(ErrorCode::Shutdown, "runner has shut down")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_runner(participant_count: usize) -> Runner {
        Runner::new(
            RunnerConfig {
                socket_path: PathBuf::from("/tmp/unused.sock"),
                participant_count,
                access_token: "token".to_string(),
            },
            Box::new(tokio::io::sink()),
        )
    }

    fn state_of(resp: RunnerResponse) -> RunState {
        match resp {
            RunnerResponse::Status(s) => s.state,
            other => panic!("expected status response, got {other:?}"),
        }
    }

    fn error_code_of(resp: RunnerResponse) -> ErrorCode {
        match resp {
            RunnerResponse::Error(e) => e.code,
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initial_oracle_states() {
        let runner = test_runner(4);

        assert_eq!(state_of(runner.status(CHECKOUT_ID).await), RunState::Go);
        assert_eq!(state_of(runner.status(COMMAND_ID).await), RunState::Wait);
        assert_eq!(state_of(runner.status(2).await), RunState::Wait);
        assert_eq!(state_of(runner.status(3).await), RunState::Wait);
    }

    #[tokio::test]
    async fn test_consecutive_status_calls_agree() {
        let runner = test_runner(3);

        let first = state_of(runner.status(2).await);
        let second = state_of(runner.status(2).await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_command_waits_for_sidecar_registration() {
        let runner = test_runner(3);

        runner.exit(CHECKOUT_ID, WaitStatus::from_code(0)).await;
        // Checkout exited but the sidecar has not registered yet.
        assert_eq!(state_of(runner.status(COMMAND_ID).await), RunState::Wait);
        assert_eq!(state_of(runner.status(2).await), RunState::Go);

        runner.register(2).await;
        assert_eq!(state_of(runner.status(COMMAND_ID).await), RunState::Go);
    }

    #[tokio::test]
    async fn test_sidecars_interrupted_after_command_exit() {
        let runner = test_runner(3);

        runner.exit(CHECKOUT_ID, WaitStatus::from_code(0)).await;
        runner.register(2).await;
        runner.register(COMMAND_ID).await;
        runner.exit(COMMAND_ID, WaitStatus::from_code(0)).await;

        assert_eq!(state_of(runner.status(2).await), RunState::Interrupt);
        // The command itself still reads Go.
        assert_eq!(state_of(runner.status(COMMAND_ID).await), RunState::Go);
    }

    #[tokio::test]
    async fn test_single_participant_boundary() {
        // With N = 1 only the checkout slot exists.
        let runner = test_runner(1);

        assert_eq!(state_of(runner.status(CHECKOUT_ID).await), RunState::Go);
        assert_eq!(
            error_code_of(runner.status(COMMAND_ID).await),
            ErrorCode::UnknownParticipant
        );

        runner.exit(CHECKOUT_ID, WaitStatus::from_code(7)).await;
        assert!(runner.done().is_cancelled());
        assert_eq!(runner.wait_status().await.exit_code, 7);
    }

    #[tokio::test]
    async fn test_register_fires_started_once() {
        let runner = test_runner(2);
        assert!(!runner.started().is_cancelled());

        // A failed registration must not fire the latch.
        runner.register(9).await;
        assert!(!runner.started().is_cancelled());

        runner.register(CHECKOUT_ID).await;
        assert!(runner.started().is_cancelled());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let runner = test_runner(2);

        runner.register(CHECKOUT_ID).await;
        assert_eq!(
            error_code_of(runner.register(CHECKOUT_ID).await),
            ErrorCode::DuplicateRegistration
        );

        // Exited slots cannot be re-registered either.
        runner.exit(CHECKOUT_ID, WaitStatus::from_code(0)).await;
        assert_eq!(
            error_code_of(runner.register(CHECKOUT_ID).await),
            ErrorCode::DuplicateRegistration
        );
    }

    #[tokio::test]
    async fn test_interrupt_overrides_oracle() {
        let runner = test_runner(3);

        runner.interrupt();
        runner.interrupt(); // idempotent

        assert_eq!(state_of(runner.status(CHECKOUT_ID).await), RunState::Interrupt);
        assert_eq!(state_of(runner.status(COMMAND_ID).await), RunState::Interrupt);
        assert_eq!(state_of(runner.status(2).await), RunState::Interrupt);
    }

    #[tokio::test]
    async fn test_rpcs_rejected_after_done() {
        let runner = test_runner(2);

        runner.terminate();
        runner.terminate(); // idempotent

        assert_eq!(error_code_of(runner.status(0).await), ErrorCode::Shutdown);
        assert_eq!(error_code_of(runner.register(0).await), ErrorCode::Shutdown);
        assert_eq!(
            error_code_of(runner.exit(0, WaitStatus::from_code(0)).await),
            ErrorCode::Shutdown
        );
        assert_eq!(
            error_code_of(runner.write_logs("aGk=").await),
            ErrorCode::Shutdown
        );
    }

    #[tokio::test]
    async fn test_lenient_re_exit_re_records_status() {
        let runner = test_runner(2);

        runner.exit(COMMAND_ID, WaitStatus::from_code(1)).await;
        let resp = runner.exit(COMMAND_ID, WaitStatus::from_code(2)).await;
        assert_eq!(resp, RunnerResponse::Ok);
        assert_eq!(runner.wait_status().await.exit_code, 2);
    }

    #[tokio::test]
    async fn test_wait_status_checkout_failure_dominates() {
        let runner = test_runner(2);

        runner.exit(CHECKOUT_ID, WaitStatus::from_code(1)).await;
        runner.exit(COMMAND_ID, WaitStatus::from_code(0)).await;
        assert_eq!(runner.wait_status().await.exit_code, 1);
    }

    #[tokio::test]
    async fn test_wait_status_ignores_sidecar_failures() {
        let runner = test_runner(3);

        runner.exit(CHECKOUT_ID, WaitStatus::from_code(0)).await;
        runner.exit(COMMAND_ID, WaitStatus::from_code(0)).await;
        runner.exit(2, WaitStatus::from_code(9)).await;

        assert!(runner.done().is_cancelled());
        assert_eq!(runner.wait_status().await.exit_code, 0);
    }

    #[tokio::test]
    async fn test_wait_status_preserves_signal() {
        let runner = test_runner(2);

        let signalled = WaitStatus {
            exit_code: 143,
            signal_code: Some(15),
        };
        runner.exit(CHECKOUT_ID, WaitStatus::from_code(0)).await;
        runner.exit(COMMAND_ID, signalled).await;
        assert_eq!(runner.wait_status().await, signalled);
    }
}
