//! Core request types: the durable record, its status state machine, and the
//! queue element exchanged between the server and its workers.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Env vars with this prefix are forwarded from the client into the child.
pub const ENV_VAR_PREFIX: &str = "NIMBUS_";

/// Env var carrying the requesting user's opaque hash.
pub const USER_ID_ENV_VAR: &str = "NIMBUS_USER_ID";

/// Forced inside every child so CLI-style output keeps its colors in logs.
pub const FORCE_COLOR_ENV_VAR: &str = "CLICOLOR_FORCE";

/// Unique identifier for a request. Client-supplied, immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(RequestId(Uuid::parse_str(s)?))
    }
}

/// Lane selector: which of the two FIFO lanes a request is scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    /// Heavy, mutually-exclusive operations; serialized per worker.
    Blocking,
    /// Short, independent operations; multiplexed on one worker's slot pool.
    NonBlocking,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::Blocking => "blocking",
            ScheduleType::NonBlocking => "non_blocking",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "blocking" => Some(ScheduleType::Blocking),
            "non_blocking" => Some(ScheduleType::NonBlocking),
            _ => None,
        }
    }

    /// Both lanes, in scheduling-priority order.
    pub fn lanes() -> [ScheduleType; 2] {
        [ScheduleType::Blocking, ScheduleType::NonBlocking]
    }
}

impl std::fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request lifecycle status.
///
/// Transitions are monotonic along the state machine: PENDING -> RUNNING ->
/// {SUCCEEDED, FAILED, ABORTED}, with ABORTED also reachable directly from
/// PENDING and CANCELLED reserved for pre-execution withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Running => "RUNNING",
            RequestStatus::Succeeded => "SUCCEEDED",
            RequestStatus::Failed => "FAILED",
            RequestStatus::Aborted => "ABORTED",
            RequestStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RequestStatus::Pending),
            "RUNNING" => Some(RequestStatus::Running),
            "SUCCEEDED" => Some(RequestStatus::Succeeded),
            "FAILED" => Some(RequestStatus::Failed),
            "ABORTED" => Some(RequestStatus::Aborted),
            "CANCELLED" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Succeeded
                | RequestStatus::Failed
                | RequestStatus::Aborted
                | RequestStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Writing the same status back is always allowed (no-op update).
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            RequestStatus::Pending => matches!(
                next,
                RequestStatus::Running | RequestStatus::Aborted | RequestStatus::Cancelled
            ),
            RequestStatus::Running => matches!(
                next,
                RequestStatus::Succeeded | RequestStatus::Failed | RequestStatus::Aborted
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured terminal error for a FAILED request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestError {
    /// Short classifier, e.g. "ExecutionError" or "WorkerCrashed"
    pub kind: String,
    /// Human-readable message
    pub message: String,
    /// Full error chain / backtrace text
    pub stacktrace: String,
}

impl RequestError {
    /// Capture an entrypoint failure with its full context chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let kind = if err.downcast_ref::<serde_json::Error>().is_some() {
            "SerializationError"
        } else if err.downcast_ref::<std::io::Error>().is_some() {
            "IoError"
        } else {
            "ExecutionError"
        };
        RequestError {
            kind: kind.to_string(),
            message: err.to_string(),
            stacktrace: format!("{err:?}"),
        }
    }
}

/// The serialized input every operation carries.
///
/// Kind-specific fields travel in `kwargs` and are deserialized by the
/// entrypoint; the other fields are interpreted by the child executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Client environment; only keys with [`ENV_VAR_PREFIX`] reach the child.
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Human-readable command the client ran to produce this request.
    #[serde(default)]
    pub entrypoint_command: String,
    /// Nested config overrides merged over server config before execution.
    #[serde(default)]
    pub config_overrides: serde_json::Value,
    /// Kind-specific keyword arguments for the entrypoint.
    #[serde(default)]
    pub kwargs: serde_json::Value,
}

impl RequestPayload {
    /// The requesting user's opaque hash, if the client sent one.
    pub fn user_id(&self) -> Option<String> {
        self.env_vars.get(USER_ID_ENV_VAR).cloned()
    }
}

/// The durable per-request record. Owned by the request store; the worker
/// and child mutate it only through the store's update protocol.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub name: String,
    /// Registry kind of the server-side callable, not a closure.
    pub entrypoint: String,
    pub request_body: RequestPayload,
    pub status: RequestStatus,
    /// Unix seconds, set at creation.
    pub created_at: i64,
    pub schedule_type: ScheduleType,
    pub user_id: Option<String>,
    /// OS pid of the child once RUNNING; never cleared.
    pub pid: Option<i64>,
    /// Combined stdout/stderr file; exists from the moment of creation.
    pub log_path: PathBuf,
    /// Present iff SUCCEEDED and the submitter wanted the value kept.
    pub return_value: Option<serde_json::Value>,
    /// Present iff FAILED.
    pub error: Option<RequestError>,
}

impl RequestRecord {
    pub fn new(
        request_id: RequestId,
        name: impl Into<String>,
        entrypoint: impl Into<String>,
        request_body: RequestPayload,
        schedule_type: ScheduleType,
        log_path: PathBuf,
    ) -> Self {
        let user_id = request_body.user_id();
        RequestRecord {
            request_id,
            name: name.into(),
            entrypoint: entrypoint.into(),
            request_body,
            status: RequestStatus::Pending,
            created_at: chrono::Utc::now().timestamp(),
            schedule_type,
            user_id,
            pid: None,
            log_path,
            return_value: None,
            error: None,
        }
    }
}

/// The pair that travels through a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueElement {
    pub request_id: RequestId,
    pub ignore_return_value: bool,
}
