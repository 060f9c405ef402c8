//! Log streaming: tail a request's combined stdout/stderr as plain text.
//!
//! The stream waits until the request leaves PENDING, then follows the log
//! file until the record reaches a terminal state. Readers tolerate partial
//! lines; the child is the only writer.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::Response,
};
use bytes::Bytes;
use stratus::{ChildRunner, RequestId, RequestStatus, RequestStore, SqliteRequestStore};
use tokio::io::AsyncReadExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::{AppState, api::models::requests::RequestIdQuery, errors::Error};

#[tracing::instrument(skip_all)]
pub async fn stream<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Query(query): Query<RequestIdQuery>,
) -> Result<Response, Error> {
    let request_id = RequestId::from_str(&query.request_id).map_err(|_| Error::BadRequest {
        message: format!("invalid request id {:?}", query.request_id),
    })?;
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

    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(16);
    tokio::spawn(tail_log(
        state.engine.store().clone(),
        request_id,
        record.log_path,
        Duration::from_millis(state.config.stream_poll_interval_ms),
        tx,
    ));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|err| Error::Internal {
            operation: format!("build stream response: {err}"),
        })
}

async fn tail_log(
    store: Arc<SqliteRequestStore>,
    request_id: RequestId,
    log_path: PathBuf,
    poll: Duration,
    tx: tokio::sync::mpsc::Sender<std::io::Result<Bytes>>,
) {
    // Wait for the request to start; an already-terminal record just plays
    // the file back to EOF below.
    loop {
        match store.get(request_id).await {
            Ok(Some(record)) if record.status == RequestStatus::Pending => {
                tokio::time::sleep(poll).await;
            }
            Ok(Some(_)) => break,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(request_id = %request_id, error = %err, "Stream status poll failed");
                return;
            }
        }
        if tx.is_closed() {
            return;
        }
    }

    let mut file = match tokio::fs::File::open(&log_path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        }
    };

    let mut buf = vec![0u8; 8192];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => {
                // At EOF: finished requests are fully played back; live ones
                // get polled again shortly.
                match store.get(request_id).await {
                    Ok(Some(record)) if record.status.is_terminal() => return,
                    Ok(Some(_)) => {}
                    _ => return,
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(poll).await;
            }
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    // Client went away.
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}
