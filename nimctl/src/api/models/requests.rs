//! Bodies for the operation endpoints and the request-inspection surface.
//!
//! Every operation body flattens [`CommonBody`] next to its kind-specific
//! arguments. The argument structs double as the deserialization target
//! inside the matching entrypoint, so the wire shape and the executed shape
//! cannot drift apart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stratus::{RequestPayload, RequestRecord};

/// Fields every operation carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonBody {
    /// Client environment; only `NIMBUS_`-prefixed keys reach the child.
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    /// Human-readable command string the client ran.
    #[serde(default)]
    pub entrypoint_command: String,
    /// Nested workload-config overrides, merged over server config.
    #[serde(default)]
    pub override_config: serde_json::Value,
}

impl CommonBody {
    /// Assemble the persisted payload for this submission.
    pub fn into_payload(self, kwargs: serde_json::Value) -> RequestPayload {
        RequestPayload {
            env_vars: self.env_vars,
            entrypoint_command: self.entrypoint_command,
            config_overrides: self.override_config,
            kwargs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchArgs {
    pub cluster_name: String,
    /// Serialized task definition.
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub retry_until_up: bool,
    #[serde(default)]
    pub idle_minutes_to_autostop: Option<i64>,
    #[serde(default)]
    pub dryrun: bool,
}

#[derive(Debug, Deserialize)]
pub struct LaunchBody {
    #[serde(flatten)]
    pub common: CommonBody,
    #[serde(flatten)]
    pub args: LaunchArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecArgs {
    pub cluster_name: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub dryrun: bool,
}

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    #[serde(flatten)]
    pub common: CommonBody,
    #[serde(flatten)]
    pub args: ExecArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOrDownArgs {
    pub cluster_name: String,
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Deserialize)]
pub struct StopOrDownBody {
    #[serde(flatten)]
    pub common: CommonBody,
    #[serde(flatten)]
    pub args: StopOrDownArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartArgs {
    pub cluster_name: String,
    #[serde(default)]
    pub retry_until_up: bool,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct StartBody {
    #[serde(flatten)]
    pub common: CommonBody,
    #[serde(flatten)]
    pub args: StartArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusArgs {
    #[serde(default)]
    pub cluster_names: Option<Vec<String>>,
    /// A refreshing status walks the provider APIs, so it schedules on the
    /// blocking lane.
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Deserialize)]
pub struct StatusBody {
    #[serde(flatten)]
    pub common: CommonBody,
    #[serde(flatten)]
    pub args: StatusArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsArgs {
    pub cluster_name: String,
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default = "default_true")]
    pub follow: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct LogsBody {
    #[serde(flatten)]
    pub common: CommonBody,
    #[serde(flatten)]
    pub args: LogsArgs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDeleteArgs {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct StorageDeleteBody {
    #[serde(flatten)]
    pub common: CommonBody,
    #[serde(flatten)]
    pub args: StorageDeleteArgs,
}

/// Body for `/abort` and `POST /requests`: one request, or all when absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestIdBody {
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Query for the record-addressed GET endpoints.
#[derive(Debug, Deserialize)]
pub struct RequestIdQuery {
    pub request_id: String,
}

/// Human-readable request listing entry: the record without its payload
/// and result blobs.
#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub request_id: String,
    pub name: String,
    pub status: stratus::RequestStatus,
    pub schedule_type: stratus::ScheduleType,
    pub user_id: Option<String>,
    pub created_at: i64,
    pub entrypoint_command: String,
    pub pid: Option<i64>,
    pub log_path: String,
}

impl From<&RequestRecord> for RequestSummary {
    fn from(record: &RequestRecord) -> Self {
        RequestSummary {
            request_id: record.request_id.to_string(),
            name: record.name.clone(),
            status: record.status,
            schedule_type: record.schedule_type,
            user_id: record.user_id.clone(),
            created_at: record.created_at,
            entrypoint_command: record.request_body.entrypoint_command.clone(),
            pid: record.pid,
            log_path: record.log_path.to_string_lossy().into_owned(),
        }
    }
}
