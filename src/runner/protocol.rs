//! Coordination RPC protocol types.
//!
//! Defines the request/response types exchanged between participant
//! containers and the in-workload coordination server. The protocol uses
//! JSON over a unix socket with newline-delimited messages; every request
//! is answered by exactly one response on the same connection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Participant ID of the checkout container.
pub const CHECKOUT_ID: u32 = 0;

/// Participant ID of the command container.
pub const COMMAND_ID: u32 = 1;

/// Whether a participant ID denotes an auxiliary sidecar.
pub fn is_sidecar(id: u32) -> bool {
    id > COMMAND_ID
}

/// Request sent from a participant to the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerRequest {
    /// Announce this participant and claim its registry slot.
    Register(RegisterRequest),

    /// Report the participant's final wait status.
    Exit(ExitRequest),

    /// Append captured output bytes to the job log.
    WriteLogs(WriteLogsRequest),

    /// Poll the run-state oracle.
    Status(StatusRequest),
}

/// Response from the runner to a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerResponse {
    /// Registration accepted.
    Registered(RegisteredResponse),

    /// Generic success (for operations with no response data).
    Ok,

    /// Current run state for the polling participant.
    Status(StatusResponse),

    /// Error response.
    Error(ErrorResponse),
}

/// Request to register a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Participant ID assigned at workload construction time.
    pub id: u32,
}

/// Request to record a participant's exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRequest {
    /// Participant ID.
    pub id: u32,
    /// Final wait status of the participant's payload.
    pub status: WaitStatus,
}

/// Request to append log bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteLogsRequest {
    /// Raw output bytes (base64 encoded for binary safety).
    pub data_base64: String,
}

/// Request to poll the run-state oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRequest {
    /// Participant ID of the caller.
    pub id: u32,
}

/// Response confirming registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredResponse {
    /// Access token the payload uses to talk to the build service.
    pub access_token: String,
}

/// Response carrying the oracle verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// The participant's current run state.
    pub state: RunState,
}

/// Error response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Verdict of the run-state oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Not yet cleared to proceed.
    Wait,
    /// Cleared to run the payload.
    Go,
    /// Stop gracefully.
    Interrupt,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "wait"),
            Self::Go => write!(f, "go"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Error codes distinguishable by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// An RPC referenced an ID outside the registry.
    UnknownParticipant,
    /// `Register` on a slot that is already connected or exited.
    DuplicateRegistration,
    /// The runner has shut down; no further RPCs are served.
    Shutdown,
    /// Log bytes could not be persisted to the sink.
    SinkWrite,
    /// Malformed request (bad JSON, bad base64).
    InvalidRequest,
    /// Internal error.
    Internal,
}

/// Composite exit descriptor for a participant's payload.
///
/// Carries the integer exit code plus the terminating signal, if any. The
/// wire encoding omits `signal_code` entirely when the process was not
/// signalled, so presence of the field is meaningful on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitStatus {
    /// Exit code of the payload. For a signalled process this is
    /// `128 + signal`, the shell convention.
    pub exit_code: i32,
    /// Terminating signal number, when the payload was killed by a signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_code: Option<i32>,
}

impl WaitStatus {
    /// A plain exit with the given code.
    pub fn from_code(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal_code: None,
        }
    }

    /// Whether the payload was terminated by a signal.
    pub fn signaled(&self) -> bool {
        self.signal_code.is_some()
    }

    /// Whether the payload exited successfully.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<std::process::ExitStatus> for WaitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self {
                    exit_code: 128 + signal,
                    signal_code: Some(signal),
                };
            }
        }
        Self::from_code(status.code().unwrap_or(-1))
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal_code {
            Some(signal) => write!(f, "killed by signal {signal}"),
            None => write!(f, "exit code {}", self.exit_code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let req = RunnerRequest::Register(RegisterRequest { id: 2 });

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("register"));

        let parsed: RunnerRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            RunnerRequest::Register(r) => assert_eq!(r.id, 2),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_exit_request_serialization() {
        let req = RunnerRequest::Exit(ExitRequest {
            id: 1,
            status: WaitStatus::from_code(42),
        });

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("exit"));
        assert!(json.contains("42"));

        let parsed: RunnerRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            RunnerRequest::Exit(r) => {
                assert_eq!(r.id, 1);
                assert_eq!(r.status.exit_code, 42);
                assert!(!r.status.signaled());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_wait_status_signal_presence_preserved() {
        // Without a signal the field must be absent on the wire.
        let plain = WaitStatus::from_code(0);
        let json = serde_json::to_string(&plain).unwrap();
        assert!(!json.contains("signal_code"));
        assert_eq!(serde_json::from_str::<WaitStatus>(&json).unwrap(), plain);

        // With a signal the field must survive the round trip.
        let signalled = WaitStatus {
            exit_code: 143,
            signal_code: Some(15),
        };
        let json = serde_json::to_string(&signalled).unwrap();
        assert!(json.contains("signal_code"));
        let parsed: WaitStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, signalled);
        assert!(parsed.signaled());
    }

    #[test]
    fn test_error_response() {
        let resp = RunnerResponse::Error(ErrorResponse {
            code: ErrorCode::UnknownParticipant,
            message: "participant id 7 not found".to_string(),
        });

        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("unknown_participant"));

        match serde_json::from_str::<RunnerResponse>(&json).unwrap() {
            RunnerResponse::Error(e) => {
                assert_eq!(e.code, ErrorCode::UnknownParticipant);
                assert!(e.message.contains('7'));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_run_state_serialization() {
        let json = serde_json::to_string(&RunState::Interrupt).unwrap();
        assert_eq!(json, "\"interrupt\"");
        assert_eq!(RunState::Go.to_string(), "go");
    }

    #[test]
    fn test_sidecar_ids() {
        assert!(!is_sidecar(CHECKOUT_ID));
        assert!(!is_sidecar(COMMAND_ID));
        assert!(is_sidecar(2));
        assert!(is_sidecar(17));
    }
}
