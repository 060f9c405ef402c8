//! Request inspection and abort endpoints.

use std::str::FromStr;
use std::time::Duration;

use axum::{
    Json,
    extract::{Query, State},
};
use serde::Serialize;
use stratus::{
    AbortOutcome, ChildRunner, RequestFilter, RequestId, RequestRecord, RequestStore, StratusError,
};

use crate::{
    AppState,
    api::models::requests::{RequestIdBody, RequestIdQuery, RequestSummary},
    errors::Error,
};

fn parse_request_id(raw: &str) -> Result<RequestId, Error> {
    RequestId::from_str(raw).map_err(|_| Error::BadRequest {
        message: format!("invalid request id {raw:?}"),
    })
}

/// Long-poll until the record reaches a terminal status, then return it in
/// full. Unknown ids are 404 immediately.
#[tracing::instrument(skip_all)]
pub async fn get_request<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Query(query): Query<RequestIdQuery>,
) -> Result<Json<RequestRecord>, Error> {
    let request_id = parse_request_id(&query.request_id)?;
    let poll = Duration::from_millis(state.config.stream_poll_interval_ms);
    loop {
        let record = state
            .engine
            .store()
            .get(request_id)
            .await
            .map_err(Error::Engine)?
            .ok_or_else(|| Error::NotFound {
                resource: "Request".to_string(),
                id: query.request_id.clone(),
            })?;
        if record.status.is_terminal() {
            return Ok(Json(record));
        }
        tokio::time::sleep(poll).await;
    }
}

async fn summaries<R: ChildRunner + 'static>(
    state: &AppState<R>,
    request_id: Option<&str>,
) -> Result<Vec<RequestSummary>, Error> {
    match request_id {
        Some(raw) => {
            let request_id = parse_request_id(raw)?;
            let record = state
                .engine
                .store()
                .get(request_id)
                .await
                .map_err(Error::Engine)?
                .ok_or_else(|| Error::NotFound {
                    resource: "Request".to_string(),
                    id: raw.to_string(),
                })?;
            Ok(vec![RequestSummary::from(&record)])
        }
        None => {
            let records = state
                .engine
                .store()
                .list(&RequestFilter::default())
                .await
                .map_err(Error::Engine)?;
            Ok(records.iter().map(RequestSummary::from).collect())
        }
    }
}

/// Human-readable listing: one request or all of them.
#[derive(Debug, Default, serde::Deserialize)]
pub struct RequestsQuery {
    pub request_id: Option<String>,
}

#[tracing::instrument(skip_all)]
pub async fn list_requests<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Query(query): Query<RequestsQuery>,
) -> Result<Json<Vec<RequestSummary>>, Error> {
    Ok(Json(summaries(&state, query.request_id.as_deref()).await?))
}

#[tracing::instrument(skip_all)]
pub async fn list_requests_body<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Json(body): Json<RequestIdBody>,
) -> Result<Json<Vec<RequestSummary>>, Error> {
    Ok(Json(summaries(&state, body.request_id.as_deref()).await?))
}

/// One abort result, as reported to the client.
#[derive(Debug, Serialize)]
pub struct AbortedRequest {
    pub request_id: String,
    #[serde(flatten)]
    pub outcome: AbortOutcome,
}

/// Abort one request, or every pending/running one when no id is given.
///
/// Aborting an already-finished record is a no-op that reports its terminal
/// state; an unknown id is 404.
#[tracing::instrument(skip_all)]
pub async fn abort<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    body: Option<Json<RequestIdBody>>,
) -> Result<Json<Vec<AbortedRequest>>, Error> {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    match body.request_id {
        Some(raw) => {
            let request_id = parse_request_id(&raw)?;
            tracing::info!(request_id = %request_id, "Aborting request");
            let outcome = state
                .engine
                .abort(request_id)
                .await
                .map_err(|err| match err {
                    StratusError::RequestNotFound(_) => Error::NotFound {
                        resource: "Request".to_string(),
                        id: raw.clone(),
                    },
                    other => Error::Engine(other),
                })?;
            Ok(Json(vec![AbortedRequest {
                request_id: raw,
                outcome,
            }]))
        }
        None => {
            tracing::info!("Aborting all pending and running requests");
            let outcomes = state.engine.abort_all().await.map_err(Error::Engine)?;
            Ok(Json(
                outcomes
                    .into_iter()
                    .map(|(request_id, outcome)| AbortedRequest {
                        request_id: request_id.to_string(),
                        outcome,
                    })
                    .collect(),
            ))
        }
    }
}
