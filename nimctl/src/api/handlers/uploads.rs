//! File-mount uploads: one tree per user hash.
//!
//! Clients push the files their tasks mount before submitting the
//! operation that consumes them. The tree is opaque to the engine; children
//! read it by path. Names are validated per component so a crafted
//! filename cannot escape the user's directory.

use std::path::{Component, Path, PathBuf};

use axum::{
    Json,
    extract::{Multipart, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};
use stratus::ChildRunner;

use crate::{AppState, errors::Error};

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub user_hash: String,
}

fn io_error(operation: &str) -> impl Fn(std::io::Error) -> Error + '_ {
    move |err| Error::Internal {
        operation: format!("{operation}: {err}"),
    }
}

/// A relative path that stays inside the mounts tree.
fn sanitize_relative(name: &str) -> Result<PathBuf, Error> {
    let path = Path::new(name);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::BadRequest {
                    message: format!("invalid upload path {name:?}"),
                });
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(Error::BadRequest {
            message: "empty upload path".to_string(),
        });
    }
    Ok(clean)
}

#[tracing::instrument(skip_all, fields(user_hash = %query.user_hash))]
pub async fn upload<R: ChildRunner + 'static>(
    State(state): State<AppState<R>>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<Value>, Error> {
    if query.user_hash.is_empty()
        || !query.user_hash.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return Err(Error::BadRequest {
            message: "user_hash must be a non-empty alphanumeric string".to_string(),
        });
    }

    let mounts_dir = state
        .config
        .uploads_dir()
        .join(&query.user_hash)
        .join("file_mounts");
    tokio::fs::create_dir_all(&mounts_dir)
        .await
        .map_err(io_error("create mounts directory"))?;

    let mut saved = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|err| Error::BadRequest {
        message: format!("malformed multipart body: {err}"),
    })? {
        let Some(file_name) = field.file_name().map(ToString::to_string) else {
            continue;
        };
        let relative = sanitize_relative(&file_name)?;
        let data = field.bytes().await.map_err(|err| Error::BadRequest {
            message: format!("failed to read upload {file_name:?}: {err}"),
        })?;

        let target = mounts_dir.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_error("create upload subdirectory"))?;
        }
        tokio::fs::write(&target, &data)
            .await
            .map_err(io_error("write uploaded file"))?;
        tracing::debug!(file = %relative.display(), bytes = data.len(), "Stored uploaded file");
        saved.push(relative.to_string_lossy().into_owned());
    }

    Ok(Json(json!({"status": "files uploaded", "saved": saved})))
}
