//! 组封面处理器：上传、查询 URL 与直接下载。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::Serialize;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::catalog::{CatalogStore, Entity, StorageError};
use crate::error::ApiError;
use crate::etag::{etag_from_metadata, is_not_modified};
use crate::locking::EntityLocks;
use crate::naming::EntityName;
use crate::staging::{StagedUpload, StagingArea};
use crate::url::PublicOrigin;

#[derive(Serialize)]
pub(crate) struct CoverUploaded {
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupCover {
    cover_url: String,
}

/// 上传组封面，替换已有的 `cover.*`。
pub async fn upload_group_cover(
    origin: PublicOrigin,
    Extension(catalog): Extension<Arc<CatalogStore>>,
    Extension(staging): Extension<Arc<StagingArea>>,
    Extension(locks): Extension<Arc<EntityLocks>>,
    multipart: Multipart,
) -> Result<JsonResponse<CoverUploaded>, ApiError> {
    let mut upload = staging.receive(multipart).await?;
    let result = store_group_cover(&origin, &catalog, &locks, &mut upload).await;
    upload.discard().await;
    result.map(JsonResponse)
}

async fn store_group_cover(
    origin: &PublicOrigin,
    catalog: &CatalogStore,
    locks: &EntityLocks,
    upload: &mut StagedUpload,
) -> Result<CoverUploaded, ApiError> {
    let group = Entity::Group(upload.required_name("groupName")?);
    let icon = upload
        .take_file("icon")
        .ok_or_else(|| ApiError::BadRequest("icon file is required".into()))?;
    let bytes = icon.size;

    let _guard = locks.lock(&group).await?;
    let committed = catalog
        .commit_entity(&group, Some(icon.into_cover()), Vec::new())
        .await?;
    let cover_name = committed
        .cover
        .ok_or_else(|| ApiError::Internal("cover missing after commit".into()))?;

    info!(group = %group.name(), file = %cover_name, bytes, "group cover uploaded");
    Ok(CoverUploaded {
        url: origin.file_url(&group, &cover_name),
    })
}

/// 返回组封面的公开 URL。
pub async fn group_cover(
    origin: PublicOrigin,
    Path(group_name): Path<String>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
) -> Result<JsonResponse<GroupCover>, ApiError> {
    let group = Entity::Group(EntityName::parse(&group_name)?);
    if !catalog.exists(&group).await? {
        return Err(ApiError::NotFound("group not found".into()));
    }
    let cover = catalog
        .find_cover(&group)
        .await?
        .ok_or_else(|| ApiError::NotFound("cover not found".into()))?;
    Ok(JsonResponse(GroupCover {
        cover_url: origin.file_url(&group, &cover.file_name),
    }))
}

/// 直接输出组封面文件内容。
pub async fn group_cover_file(
    Path(group_name): Path<String>,
    request_headers: HeaderMap,
    Extension(catalog): Extension<Arc<CatalogStore>>,
) -> Result<Response, ApiError> {
    let group = Entity::Group(EntityName::parse(&group_name)?);
    let cover = catalog
        .find_cover(&group)
        .await?
        .ok_or_else(|| ApiError::NotFound("cover not found".into()))?;
    let path = catalog.entity_file(&group, &cover.file_name);
    let metadata = fs::metadata(&path).await.map_err(StorageError::from)?;

    let mut response_headers = HeaderMap::new();
    let etag = etag_from_metadata(&metadata);
    response_headers.insert(header::ETAG, header_value(&etag)?);
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if let Ok(modified) = metadata.modified() {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }
    if is_not_modified(&request_headers, &etag) {
        debug!(group = %group.name(), "group cover not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    response_headers.insert(header::CONTENT_TYPE, header_value(&cover.content_type)?);
    response_headers.insert(
        header::CONTENT_LENGTH,
        header_value(&metadata.len().to_string())?,
    );
    let file = File::open(&path).await.map_err(StorageError::from)?;
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value).map_err(|_| ApiError::Internal("failed to build header".into()))
}
