//! 曲目处理器：独立曲目的上传、列表、查询与删除，以及跨专辑的曲目列表。

use axum::extract::{Extension, Multipart, Path, Query};
use axum::response::Json as JsonResponse;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::albums::Message;
use crate::catalog::{CatalogStore, Entity, StorageError};
use crate::error::ApiError;
use crate::locking::EntityLocks;
use crate::naming::{EntityName, stem_of};
use crate::staging::{StagedUpload, StagingArea};
use crate::url::PublicOrigin;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumQuery {
    album_name: Option<String>,
}

impl AlbumQuery {
    fn album(&self) -> Result<Option<EntityName>, ApiError> {
        match self.album_name.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => Ok(Some(EntityName::parse(value)?)),
            _ => Ok(None),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackUploaded {
    message: String,
    cover_url: String,
    audio_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackEntry {
    track_name: String,
    cover_url: Option<String>,
    audio_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumTrackEntry {
    track_name: String,
    cover_url: Option<String>,
    audio_url: String,
    album_name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackInfo {
    cover_url: Option<String>,
    audio_url: String,
}

/// 上传独立曲目；同名曲目已存在时返回 409。
pub async fn upload_track(
    origin: PublicOrigin,
    Extension(catalog): Extension<Arc<CatalogStore>>,
    Extension(staging): Extension<Arc<StagingArea>>,
    Extension(locks): Extension<Arc<EntityLocks>>,
    multipart: Multipart,
) -> Result<JsonResponse<TrackUploaded>, ApiError> {
    let mut upload = staging.receive(multipart).await?;
    let result = store_track(&origin, &catalog, &locks, &mut upload).await;
    upload.discard().await;
    result.map(JsonResponse)
}

async fn store_track(
    origin: &PublicOrigin,
    catalog: &CatalogStore,
    locks: &EntityLocks,
    upload: &mut StagedUpload,
) -> Result<TrackUploaded, ApiError> {
    let group = upload.required_name("groupName")?;
    let track_name = upload.required_name("trackName")?;
    let cover = upload
        .take_file("cover")
        .ok_or_else(|| ApiError::BadRequest("cover file is required".into()))?;
    let audio = upload
        .take_file("audio")
        .ok_or_else(|| ApiError::BadRequest("audio file is required".into()))?;
    let bytes = cover.size + audio.size;
    let audio = audio.into_audio()?;

    let track = Entity::Track(group, track_name);
    let _guard = locks.lock(&track).await?;
    if catalog.exists(&track).await? {
        return Err(ApiError::Conflict("track already exists".into()));
    }
    let committed = catalog
        .commit_entity(&track, Some(cover.into_cover()), vec![audio])
        .await?;
    let (Some(cover_name), Some(audio_name)) = (committed.cover, committed.audio.first()) else {
        return Err(ApiError::Internal("track files missing after commit".into()));
    };

    info!(group = %track.group(), track = %track.name(), bytes, "track uploaded");
    Ok(TrackUploaded {
        message: "track uploaded".into(),
        cover_url: origin.file_url(&track, &cover_name),
        audio_url: origin.file_url(&track, audio_name),
    })
}

/// 列出独立曲目；带 `albumName` 时只看 `Tracks/{albumName}`。
pub async fn list_tracks(
    origin: PublicOrigin,
    Path(group_name): Path<String>,
    Query(query): Query<AlbumQuery>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
) -> Result<JsonResponse<Vec<TrackEntry>>, ApiError> {
    let group = EntityName::parse(&group_name)?;
    let names = match query.album()? {
        Some(name) => vec![name],
        None => catalog.list_tracks(&group).await?.unwrap_or_default(),
    };

    let mut tracks = Vec::with_capacity(names.len());
    for name in names {
        let track = Entity::Track(group.clone(), name);
        let Some(audio) = catalog.find_track_audio(&track).await? else {
            if catalog.exists(&track).await? {
                warn!(group = %group, track = %track.name(), "audio file missing for track");
            }
            continue;
        };
        let cover_url = catalog
            .find_cover(&track)
            .await?
            .map(|cover| origin.file_url(&track, &cover.file_name));
        tracks.push(TrackEntry {
            track_name: track.name().to_string(),
            cover_url,
            audio_url: origin.file_url(&track, &audio),
        });
    }
    Ok(JsonResponse(tracks))
}

/// 列出组内所有专辑中的曲目；组没有专辑目录时返回 404。
pub async fn all_tracks(
    origin: PublicOrigin,
    Path(group_name): Path<String>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
) -> Result<JsonResponse<Vec<AlbumTrackEntry>>, ApiError> {
    let group = EntityName::parse(&group_name)?;
    let albums = catalog
        .list_albums(&group)
        .await?
        .ok_or_else(|| ApiError::NotFound("albums not found".into()))?;

    let mut tracks = Vec::new();
    for title in albums {
        let album = Entity::Album(group.clone(), title);
        match album_entries(&origin, &catalog, &album).await {
            Ok(entries) => tracks.extend(entries),
            Err(err) => {
                warn!(group = %group, album = %album.name(), error = %err, "skipping unreadable album");
            }
        }
    }
    Ok(JsonResponse(tracks))
}

async fn album_entries(
    origin: &PublicOrigin,
    catalog: &CatalogStore,
    album: &Entity,
) -> Result<Vec<AlbumTrackEntry>, StorageError> {
    let cover_url = catalog
        .find_cover(album)
        .await?
        .map(|cover| origin.file_url(album, &cover.file_name));
    let audio = catalog.list_audio(album).await?.unwrap_or_default();
    Ok(audio
        .into_iter()
        .map(|file_name| AlbumTrackEntry {
            track_name: stem_of(&file_name).to_string(),
            cover_url: cover_url.clone(),
            audio_url: origin.file_url(album, &file_name),
            album_name: album.name().to_string(),
        })
        .collect())
}

/// 按名称查找曲目：先查独立曲目，再按名称顺序查各专辑。
pub async fn track_info(
    origin: PublicOrigin,
    Path((group_name, track_name)): Path<(String, String)>,
    Query(query): Query<AlbumQuery>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
) -> Result<JsonResponse<TrackInfo>, ApiError> {
    let group = EntityName::parse(&group_name)?;
    let track_name = EntityName::parse(&track_name)?;

    if let Some(album_name) = query.album()? {
        let album = Entity::Album(group, album_name);
        return match lookup_in_album(&origin, &catalog, &album, &track_name).await? {
            Some(info) => Ok(JsonResponse(info)),
            None => Err(ApiError::NotFound("track not found in album".into())),
        };
    }

    let standalone = Entity::Track(group.clone(), track_name.clone());
    if let Some(audio) = catalog.find_track_audio(&standalone).await? {
        let cover_url = catalog
            .find_cover(&standalone)
            .await?
            .map(|cover| origin.file_url(&standalone, &cover.file_name));
        return Ok(JsonResponse(TrackInfo {
            cover_url,
            audio_url: origin.file_url(&standalone, &audio),
        }));
    }

    for title in catalog.list_albums(&group).await?.unwrap_or_default() {
        let album = Entity::Album(group.clone(), title);
        if let Some(info) = lookup_in_album(&origin, &catalog, &album, &track_name).await? {
            return Ok(JsonResponse(info));
        }
    }
    Err(ApiError::NotFound("track not found".into()))
}

async fn lookup_in_album(
    origin: &PublicOrigin,
    catalog: &CatalogStore,
    album: &Entity,
    track_name: &EntityName,
) -> Result<Option<TrackInfo>, StorageError> {
    let Some(audio) = catalog.find_audio_named(album, track_name.as_str()).await? else {
        return Ok(None);
    };
    let cover_url = catalog
        .find_cover(album)
        .await?
        .map(|cover| origin.file_url(album, &cover.file_name));
    Ok(Some(TrackInfo {
        cover_url,
        audio_url: origin.file_url(album, &audio),
    }))
}

/// 删除独立曲目目录（幂等）。
pub async fn delete_track(
    Path((group_name, track_name)): Path<(String, String)>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
    Extension(locks): Extension<Arc<EntityLocks>>,
) -> Result<JsonResponse<Message>, ApiError> {
    let track = Entity::Track(
        EntityName::parse(&group_name)?,
        EntityName::parse(&track_name)?,
    );
    let _guard = locks.lock(&track).await?;
    let removed = catalog.remove_entity(&track).await?;
    info!(group = %track.group(), track = %track.name(), removed, "delete track");
    Ok(JsonResponse(Message {
        message: format!(
            "track '{}' deleted from group '{}'",
            track.name(),
            track.group()
        ),
    }))
}
