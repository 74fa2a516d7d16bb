//! `/v1/files`: upload, listing with cursor pagination, metadata, content
//! download, and deletion.

use axum::{
    Extension, Json,
    extract::{Multipart, Path, Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::auth::AuthContext;
use crate::db::models::files::{ACCEPTED_PURPOSES, FileRow};
use crate::errors::{Error, Result};
use crate::types::FileId;

/// OpenAI-shaped file object.
#[derive(Debug, Serialize)]
pub struct FileObject {
    pub id: FileId,
    pub object: &'static str,
    pub bytes: i64,
    pub created_at: i64,
    pub filename: String,
    pub purpose: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl From<FileRow> for FileObject {
    fn from(row: FileRow) -> Self {
        Self {
            id: row.id,
            object: "file",
            bytes: row.bytes,
            created_at: row.created_at.timestamp(),
            filename: row.filename,
            purpose: row.purpose,
            status: row.status,
            expires_at: row.expires_at.map(|at| at.timestamp()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub object: &'static str,
    pub data: Vec<FileObject>,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub after: Option<FileId>,
}

pub async fn upload(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    mut multipart: Multipart,
) -> Result<Json<FileObject>> {
    let mut purpose = None;
    let mut file: Option<(Bytes, String, String)> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::InvalidRequest {
        message: format!("malformed multipart body: {e}"),
    })? {
        match field.name().unwrap_or_default() {
            "purpose" => {
                purpose = Some(field.text().await.map_err(|e| Error::InvalidRequest {
                    message: format!("malformed purpose field: {e}"),
                })?);
            }
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .unwrap_or_else(|| mime_guess::from_path(&filename).first_or_octet_stream().to_string());
                let data = field.bytes().await.map_err(|e| Error::InvalidRequest {
                    message: format!("failed to read file: {e}"),
                })?;
                file = Some((data, filename, content_type));
            }
            _ => {}
        }
    }

    let purpose = purpose.ok_or_else(|| Error::InvalidRequest {
        message: "`purpose` is required".to_string(),
    })?;
    if !ACCEPTED_PURPOSES.contains(&purpose.as_str()) {
        return Err(Error::InvalidRequest {
            message: format!("unsupported purpose `{purpose}`; accepted: {}", ACCEPTED_PURPOSES.join(", ")),
        });
    }
    let (data, filename, content_type) = file.ok_or_else(|| Error::InvalidRequest {
        message: "`file` is required".to_string(),
    })?;
    if data.is_empty() {
        return Err(Error::InvalidRequest {
            message: "uploaded file is empty".to_string(),
        });
    }

    let row = state
        .files
        .upload(ctx.tenant.id, &filename, &purpose, &content_type, data, None)
        .await?;
    Ok(Json(row.into()))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<FileListResponse>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    // Fetch one extra row to learn whether a next page exists
    let mut rows = state.files.list(ctx.tenant.id, limit + 1, query.after).await?;
    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    Ok(Json(FileListResponse {
        object: "list",
        data: rows.into_iter().map(FileObject::from).collect(),
        has_more,
    }))
}

pub async fn retrieve(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<FileId>,
) -> Result<Json<FileObject>> {
    let row = state.files.get(ctx.tenant.id, id).await?;
    Ok(Json(row.into()))
}

pub async fn content(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<FileId>,
) -> Result<Response> {
    let (row, data) = state.files.content(ctx.tenant.id, id).await?;
    Ok(([(CONTENT_TYPE, row.content_type)], data).into_response())
}

#[derive(Debug, Serialize)]
pub struct FileDeleteResponse {
    pub id: FileId,
    pub object: &'static str,
    pub deleted: bool,
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<FileId>,
) -> Result<Json<FileDeleteResponse>> {
    let row = state.files.delete(ctx.tenant.id, id).await?;
    Ok(Json(FileDeleteResponse {
        id: row.id,
        object: "file",
        deleted: true,
    }))
}
