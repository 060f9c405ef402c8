//! Domain operation endpoints.
//!
//! Each handler is a thin binding of `(name, entrypoint kind, schedule
//! type)` over the shared submission path: the request id minted by the
//! middleware becomes the durable record's id, the body splits into common
//! fields and entrypoint kwargs, and the engine takes it from there. The
//! client reads the id back from the `X-Request-ID` response header and
//! polls `/get` or `/stream`.

use axum::{Extension, Json, extract::State, http::StatusCode};
use stratus::{ChildRunner, RequestId, ScheduleType, StratusError, SubmitRequest};

use crate::{
    AppState,
    api::models::requests::{
        CommonBody, ExecBody, LaunchBody, LogsBody, StartBody, StatusBody, StopOrDownBody,
        StorageDeleteBody,
    },
    errors::Error,
    middleware::ApiRequestId,
};

/// Create the record and enqueue it; 202 tells the client to poll.
async fn schedule<R: ChildRunner + 'static>(
    state: &AppState<R>,
    api_id: ApiRequestId,
    name: &str,
    schedule_type: ScheduleType,
    ignore_return_value: bool,
    common: CommonBody,
    kwargs: serde_json::Value,
) -> Result<StatusCode, Error> {
    state
        .engine
        .submit(SubmitRequest {
            request_id: RequestId::from(api_id.0),
            name: name.to_string(),
            entrypoint: name.to_string(),
            body: common.into_payload(kwargs),
            schedule_type,
            ignore_return_value,
        })
        .await
        .map_err(|err| match err {
            StratusError::Queue(message) => Error::ServiceUnavailable { message },
            other => Error::Engine(other),
        })?;
    Ok(StatusCode::ACCEPTED)
}

fn kwargs<T: serde::Serialize>(args: &T) -> Result<serde_json::Value, Error> {
    serde_json::to_value(args).map_err(|err| Error::Internal {
        operation: format!("serialize request kwargs: {err}"),
    })
}

#[tracing::instrument(skip_all)]
pub async fn launch<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<LaunchBody>,
) -> Result<StatusCode, Error> {
    let args = kwargs(&body.args)?;
    schedule(&state, api_id, "launch", ScheduleType::Blocking, false, body.common, args).await
}

#[tracing::instrument(skip_all)]
pub async fn exec<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<ExecBody>,
) -> Result<StatusCode, Error> {
    let args = kwargs(&body.args)?;
    schedule(&state, api_id, "exec", ScheduleType::Blocking, false, body.common, args).await
}

#[tracing::instrument(skip_all)]
pub async fn stop<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<StopOrDownBody>,
) -> Result<StatusCode, Error> {
    let args = kwargs(&body.args)?;
    schedule(&state, api_id, "stop", ScheduleType::Blocking, false, body.common, args).await
}

#[tracing::instrument(skip_all)]
pub async fn start<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<StartBody>,
) -> Result<StatusCode, Error> {
    let args = kwargs(&body.args)?;
    schedule(&state, api_id, "start", ScheduleType::Blocking, false, body.common, args).await
}

#[tracing::instrument(skip_all)]
pub async fn down<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<StopOrDownBody>,
) -> Result<StatusCode, Error> {
    let args = kwargs(&body.args)?;
    schedule(&state, api_id, "down", ScheduleType::Blocking, false, body.common, args).await
}

/// A refreshing status hits provider APIs and serializes with other heavy
/// work; a cached one multiplexes on the non-blocking lane.
#[tracing::instrument(skip_all)]
pub async fn status<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<StatusBody>,
) -> Result<StatusCode, Error> {
    let schedule_type = if body.args.refresh {
        ScheduleType::Blocking
    } else {
        ScheduleType::NonBlocking
    };
    let args = kwargs(&body.args)?;
    schedule(&state, api_id, "status", schedule_type, false, body.common, args).await
}

#[tracing::instrument(skip_all)]
pub async fn logs<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<LogsBody>,
) -> Result<StatusCode, Error> {
    let args = kwargs(&body.args)?;
    schedule(&state, api_id, "logs", ScheduleType::NonBlocking, false, body.common, args).await
}

#[tracing::instrument(skip_all)]
pub async fn cost_report<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
) -> Result<StatusCode, Error> {
    schedule(
        &state,
        api_id,
        "cost_report",
        ScheduleType::NonBlocking,
        false,
        CommonBody::default(),
        serde_json::json!({}),
    )
    .await
}

#[tracing::instrument(skip_all)]
pub async fn storage_ls<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
) -> Result<StatusCode, Error> {
    schedule(
        &state,
        api_id,
        "storage_ls",
        ScheduleType::NonBlocking,
        false,
        CommonBody::default(),
        serde_json::json!({}),
    )
    .await
}

#[tracing::instrument(skip_all)]
pub async fn storage_delete<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Extension(api_id): Extension<ApiRequestId>,
    Json(body): Json<StorageDeleteBody>,
) -> Result<StatusCode, Error> {
    let args = kwargs(&body.args)?;
    schedule(
        &state,
        api_id,
        "storage_delete",
        ScheduleType::Blocking,
        false,
        body.common,
        args,
    )
    .await
}
