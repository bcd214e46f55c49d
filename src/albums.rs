//! 专辑相关处理器：封面列表、上传、曲目列表、增删曲目。

use axum::extract::{Extension, Multipart, Path};
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::{CatalogStore, Entity};
use crate::error::ApiError;
use crate::locking::EntityLocks;
use crate::naming::{EntityName, stem_of};
use crate::staging::{StagedFile, StagedUpload, StagingArea};
use crate::url::PublicOrigin;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumCover {
    album_title: String,
    cover_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumUploaded {
    message: String,
    cover_url: String,
    tracks_urls: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumTrack {
    track_name: String,
    audio_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AlbumTracks {
    album_name: String,
    cover_url: Option<String>,
    tracks: Vec<AlbumTrack>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TrackAdded {
    track_url: String,
}

#[derive(Serialize)]
pub(crate) struct Message {
    pub(crate) message: String,
}

/// 列出组内所有带封面的专辑。
pub async fn album_covers(
    origin: PublicOrigin,
    Path(group_name): Path<String>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
) -> Result<JsonResponse<Vec<AlbumCover>>, ApiError> {
    let group = EntityName::parse(&group_name)?;
    let albums = catalog.list_albums(&group).await?.unwrap_or_default();

    let mut covers = Vec::with_capacity(albums.len());
    for title in albums {
        let album = Entity::Album(group.clone(), title);
        if let Some(cover) = catalog.find_cover(&album).await? {
            covers.push(AlbumCover {
                album_title: album.name().to_string(),
                cover_url: origin.file_url(&album, &cover.file_name),
            });
        }
    }
    Ok(JsonResponse(covers))
}

/// 上传专辑：封面加至少一首曲目，整体提交。
pub async fn upload_album(
    origin: PublicOrigin,
    Extension(catalog): Extension<Arc<CatalogStore>>,
    Extension(staging): Extension<Arc<StagingArea>>,
    Extension(locks): Extension<Arc<EntityLocks>>,
    multipart: Multipart,
) -> Result<JsonResponse<AlbumUploaded>, ApiError> {
    let mut upload = staging.receive(multipart).await?;
    let result = store_album(&origin, &catalog, &locks, &mut upload).await;
    upload.discard().await;
    result.map(JsonResponse)
}

async fn store_album(
    origin: &PublicOrigin,
    catalog: &CatalogStore,
    locks: &EntityLocks,
    upload: &mut StagedUpload,
) -> Result<AlbumUploaded, ApiError> {
    let group = upload.required_name("groupName")?;
    let title = upload.required_name("title")?;
    let cover = upload
        .take_file("cover")
        .ok_or_else(|| ApiError::BadRequest("cover file is required".into()))?;
    let tracks = upload.take_files(&["tracks", "tracks[]"]);
    if tracks.is_empty() {
        return Err(ApiError::BadRequest("at least one track is required".into()));
    }
    let bytes: u64 = cover.size + tracks.iter().map(|track| track.size).sum::<u64>();
    let audio = tracks
        .into_iter()
        .map(StagedFile::into_audio)
        .collect::<Result<Vec<_>, _>>()?;

    let album = Entity::Album(group, title);
    let _guard = locks.lock(&album).await?;
    let committed = catalog
        .commit_entity(&album, Some(cover.into_cover()), audio)
        .await?;
    let cover_name = committed
        .cover
        .ok_or_else(|| ApiError::Internal("cover missing after commit".into()))?;

    info!(
        group = %album.group(),
        album = %album.name(),
        tracks = committed.audio.len(),
        bytes,
        "album uploaded"
    );
    Ok(AlbumUploaded {
        message: "album uploaded".into(),
        cover_url: origin.file_url(&album, &cover_name),
        tracks_urls: committed
            .audio
            .iter()
            .map(|file_name| origin.file_url(&album, file_name))
            .collect(),
    })
}

/// 专辑详情：封面与音频文件列表；专辑不存在时返回空结果。
pub async fn album_tracks(
    origin: PublicOrigin,
    Path((group_name, album_name)): Path<(String, String)>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
) -> Result<JsonResponse<AlbumTracks>, ApiError> {
    let album = Entity::Album(
        EntityName::parse(&group_name)?,
        EntityName::parse(&album_name)?,
    );
    let cover_url = catalog
        .find_cover(&album)
        .await?
        .map(|cover| origin.file_url(&album, &cover.file_name));
    let tracks = catalog
        .list_audio(&album)
        .await?
        .unwrap_or_default()
        .into_iter()
        .map(|file_name| AlbumTrack {
            track_name: stem_of(&file_name).to_string(),
            audio_url: origin.file_url(&album, &file_name),
        })
        .collect();

    Ok(JsonResponse(AlbumTracks {
        album_name: album.name().to_string(),
        cover_url,
        tracks,
    }))
}

/// 删除整张专辑（幂等）。
pub async fn delete_album(
    Path((group_name, album_name)): Path<(String, String)>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
    Extension(locks): Extension<Arc<EntityLocks>>,
) -> Result<JsonResponse<Message>, ApiError> {
    let album = Entity::Album(
        EntityName::parse(&group_name)?,
        EntityName::parse(&album_name)?,
    );
    let _guard = locks.lock(&album).await?;
    let removed = catalog.remove_entity(&album).await?;
    info!(group = %album.group(), album = %album.name(), removed, "delete album");
    Ok(JsonResponse(Message {
        message: format!("album '{}' deleted", album.name()),
    }))
}

/// 向已有专辑追加一首曲目。
pub async fn add_track(
    origin: PublicOrigin,
    Path((group_name, album_name)): Path<(String, String)>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
    Extension(staging): Extension<Arc<StagingArea>>,
    Extension(locks): Extension<Arc<EntityLocks>>,
    multipart: Multipart,
) -> Result<JsonResponse<TrackAdded>, ApiError> {
    let album = Entity::Album(
        EntityName::parse(&group_name)?,
        EntityName::parse(&album_name)?,
    );
    let mut upload = staging.receive(multipart).await?;
    let result = store_album_track(&origin, &catalog, &locks, &album, &mut upload).await;
    upload.discard().await;
    result.map(JsonResponse)
}

async fn store_album_track(
    origin: &PublicOrigin,
    catalog: &CatalogStore,
    locks: &EntityLocks,
    album: &Entity,
    upload: &mut StagedUpload,
) -> Result<TrackAdded, ApiError> {
    let track = upload
        .take_file("track")
        .ok_or_else(|| ApiError::BadRequest("track file is required".into()))?;
    let bytes = track.size;
    let audio = track.into_audio()?;

    let _guard = locks.lock(album).await?;
    if !catalog.exists(album).await? {
        return Err(ApiError::NotFound("album not found".into()));
    }
    let committed = catalog.commit_entity(album, None, vec![audio]).await?;
    let file_name = committed
        .audio
        .first()
        .ok_or_else(|| ApiError::Internal("track missing after commit".into()))?;

    info!(
        group = %album.group(),
        album = %album.name(),
        file = %file_name,
        bytes,
        "track added to album"
    );
    Ok(TrackAdded {
        track_url: origin.file_url(album, file_name),
    })
}

/// 从专辑中删除单个曲目文件，保留其他文件与封面。
pub async fn delete_album_track(
    Path((group_name, album_name, track_name)): Path<(String, String, String)>,
    Extension(catalog): Extension<Arc<CatalogStore>>,
    Extension(locks): Extension<Arc<EntityLocks>>,
) -> Result<JsonResponse<Message>, ApiError> {
    let album = Entity::Album(
        EntityName::parse(&group_name)?,
        EntityName::parse(&album_name)?,
    );
    let track = EntityName::parse(&track_name)?;
    let _guard = locks.lock(&album).await?;
    if !catalog.exists(&album).await? {
        return Err(ApiError::NotFound("album not found".into()));
    }
    let Some(file_name) = catalog.remove_album_track(&album, track.as_str()).await? else {
        warn!(group = %album.group(), album = %album.name(), track = %track, "track file not found");
        return Err(ApiError::NotFound("track not found in album".into()));
    };
    info!(group = %album.group(), album = %album.name(), file = %file_name, "delete album track");
    Ok(JsonResponse(Message {
        message: format!("track '{track}' deleted from album '{}'", album.name()),
    }))
}
