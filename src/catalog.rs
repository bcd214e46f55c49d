//! 目录即数据库：组 / 专辑 / 曲目到文件系统路径的约定映射。
//!
//! Layout under the catalog root:
//!
//! ```text
//! groups/{group}/cover.{ext}
//! groups/{group}/Albums/{album}/cover.{ext} + audio files
//! groups/{group}/Tracks/{track}/cover.{ext} + one audio file
//! ```
//!
//! Each entity directory may also hold a `.catalog.json` sidecar recording
//! which files are its cover and audio. Directories without a sidecar are
//! read through the filename convention alone.

use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::atomic::write_atomic;
use crate::naming::{EntityName, NameError, extension_of, stem_of};

pub const GROUPS_DIR: &str = "groups";
pub const ALBUMS_DIR: &str = "Albums";
pub const TRACKS_DIR: &str = "Tracks";
pub const COVER_STEM: &str = "cover";
pub const META_FILE: &str = ".catalog.json";
pub const AUDIO_EXTENSIONS: [&str; 5] = [".mp3", ".wav", ".flac", ".ogg", ".m4a"];

#[derive(Debug)]
pub enum StorageError {
    InvalidName(NameError),
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<NameError> for StorageError {
    fn from(err: NameError) -> Self {
        StorageError::InvalidName(err)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::InvalidName(err) => write!(f, "invalid name: {err}"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

/// A catalog entity, addressed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Group(EntityName),
    Album(EntityName, EntityName),
    Track(EntityName, EntityName),
}

impl Entity {
    pub fn group(&self) -> &EntityName {
        match self {
            Entity::Group(group) | Entity::Album(group, _) | Entity::Track(group, _) => group,
        }
    }

    /// 实体自身的名称（组名、专辑名或曲目名）。
    pub fn name(&self) -> &EntityName {
        match self {
            Entity::Group(name) | Entity::Album(_, name) | Entity::Track(_, name) => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Entity::Group(_) => "group",
            Entity::Album(..) => "album",
            Entity::Track(..) => "track",
        }
    }

    /// 相对于目录根的路径段，也是公开 URL 的路径段。
    pub fn segments(&self) -> Vec<&str> {
        let mut segments = vec![GROUPS_DIR, self.group().as_str()];
        match self {
            Entity::Group(_) => {}
            Entity::Album(_, album) => segments.extend([ALBUMS_DIR, album.as_str()]),
            Entity::Track(_, track) => segments.extend([TRACKS_DIR, track.as_str()]),
        }
        segments
    }

    pub fn lock_key(&self) -> String {
        self.segments().join("/")
    }
}

/// A file recorded in the entity sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    pub file_name: String,
    pub content_type: String,
    pub extension: String,
}

impl StoredFile {
    pub fn new(file_name: &str, declared_type: Option<&str>) -> Self {
        let content_type = declared_type
            .filter(|value| !value.trim().is_empty() && *value != "application/octet-stream")
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_guess::from_path(file_name)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });
        Self {
            file_name: file_name.to_string(),
            content_type,
            extension: extension_of(file_name).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<StoredFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<StoredFile>,
}

/// A staged file on its way into an entity directory.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub source: PathBuf,
    pub file: StoredFile,
}

/// File names written by [`CatalogStore::commit_entity`].
#[derive(Debug, Default)]
pub struct CommittedFiles {
    pub cover: Option<String>,
    pub audio: Vec<String>,
}

struct AppliedMove {
    dest: PathBuf,
    backup: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct CatalogStore {
    root: PathBuf,
}

impl CatalogStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn groups_root(&self) -> PathBuf {
        self.root.join(GROUPS_DIR)
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.groups_root()).await
    }

    pub fn entity_dir(&self, entity: &Entity) -> PathBuf {
        entity
            .segments()
            .into_iter()
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    pub fn entity_file(&self, entity: &Entity, file_name: &str) -> PathBuf {
        self.entity_dir(entity).join(file_name)
    }

    pub async fn exists(&self, entity: &Entity) -> Result<bool, StorageError> {
        match fs::metadata(self.entity_dir(entity)).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(err) if is_missing(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// 读取实体元数据；缺失或损坏时回退为空。
    pub async fn read_meta(&self, entity: &Entity) -> EntityMeta {
        let path = self.entity_file(entity, META_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if !is_missing(&err) {
                    warn!(path = ?path, error = %err, "failed to read entity metadata");
                }
                return EntityMeta::default();
            }
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            warn!(path = ?path, error = %err, "ignoring malformed entity metadata");
            EntityMeta::default()
        })
    }

    pub async fn write_meta(&self, entity: &Entity, meta: &EntityMeta) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(meta).map_err(io::Error::other)?;
        write_atomic(&self.entity_file(entity, META_FILE), &bytes).await?;
        Ok(())
    }

    /// 列出目录下的文件名（已排序、跳过隐藏文件）；目录不存在时返回 `None`。
    pub async fn list_files(&self, entity: &Entity) -> Result<Option<Vec<String>>, StorageError> {
        list_entries(&self.entity_dir(entity), false).await
    }

    pub async fn list_albums(
        &self,
        group: &EntityName,
    ) -> Result<Option<Vec<EntityName>>, StorageError> {
        self.list_children(group, ALBUMS_DIR).await
    }

    pub async fn list_tracks(
        &self,
        group: &EntityName,
    ) -> Result<Option<Vec<EntityName>>, StorageError> {
        self.list_children(group, TRACKS_DIR).await
    }

    async fn list_children(
        &self,
        group: &EntityName,
        kind_dir: &str,
    ) -> Result<Option<Vec<EntityName>>, StorageError> {
        let dir = self.entity_dir(&Entity::Group(group.clone())).join(kind_dir);
        let Some(names) = list_entries(&dir, true).await? else {
            return Ok(None);
        };
        let children = names
            .into_iter()
            .filter_map(|name| match EntityName::parse(&name) {
                Ok(parsed) if parsed.as_str() == name => Some(parsed),
                _ => {
                    debug!(dir = ?dir, name = %name, "skipping directory with unusable name");
                    None
                }
            })
            .collect();
        Ok(Some(children))
    }

    /// 查找实体封面：优先元数据记录，其次 `cover.*` 约定。
    pub async fn find_cover(&self, entity: &Entity) -> Result<Option<StoredFile>, StorageError> {
        let Some(files) = self.list_files(entity).await? else {
            return Ok(None);
        };
        let meta = self.read_meta(entity).await;
        if let Some(cover) = meta.cover
            && files.contains(&cover.file_name)
        {
            return Ok(Some(cover));
        }
        Ok(files
            .iter()
            .find(|name| is_cover_name(name))
            .map(|name| StoredFile::new(name, None)))
    }

    /// 列出目录中的音频文件；目录不存在时返回 `None`。
    pub async fn list_audio(&self, entity: &Entity) -> Result<Option<Vec<String>>, StorageError> {
        Ok(self
            .list_files(entity)
            .await?
            .map(|files| files.into_iter().filter(|name| is_audio_name(name)).collect()))
    }

    /// 独立曲目目录的音频：元数据记录 → 与目录同名 → 唯一的音频文件。
    pub async fn find_track_audio(&self, entity: &Entity) -> Result<Option<String>, StorageError> {
        let Some(audio) = self.list_audio(entity).await? else {
            return Ok(None);
        };
        let meta = self.read_meta(entity).await;
        if let Some(recorded) = meta.audio
            && audio.contains(&recorded.file_name)
        {
            return Ok(Some(recorded.file_name));
        }
        let track_name = entity.name().as_str();
        if let Some(exact) = audio.iter().find(|name| stem_of(name) == track_name) {
            return Ok(Some(exact.clone()));
        }
        match audio.as_slice() {
            [only] => Ok(Some(only.clone())),
            _ => Ok(None),
        }
    }

    /// 按名称（忽略大小写、不含扩展名）查找音频文件。
    pub async fn find_audio_named(
        &self,
        entity: &Entity,
        track_name: &str,
    ) -> Result<Option<String>, StorageError> {
        let Some(audio) = self.list_audio(entity).await? else {
            return Ok(None);
        };
        let wanted = track_name.to_lowercase();
        Ok(audio
            .into_iter()
            .find(|name| stem_of(name).to_lowercase() == wanted))
    }

    /// 递归删除实体目录，目标不存在时视为成功。
    pub async fn remove_entity(&self, entity: &Entity) -> Result<bool, StorageError> {
        match fs::remove_dir_all(self.entity_dir(entity)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// 删除专辑中基名与 `track_name` 完全相同的音频文件，返回被删除的文件名。
    pub async fn remove_album_track(
        &self,
        album: &Entity,
        track_name: &str,
    ) -> Result<Option<String>, StorageError> {
        let Some(files) = self.list_files(album).await? else {
            return Err(io::Error::new(ErrorKind::NotFound, "album not found").into());
        };
        let Some(file_name) = files
            .into_iter()
            .find(|name| {
                is_audio_name(name) && !is_cover_name(name) && stem_of(name) == track_name
            })
        else {
            return Ok(None);
        };
        fs::remove_file(self.entity_file(album, &file_name)).await?;
        Ok(Some(file_name))
    }

    /// 将暂存文件整体提交到实体目录，并更新封面与元数据。
    pub async fn commit_entity(
        &self,
        entity: &Entity,
        cover: Option<IncomingFile>,
        audio: Vec<IncomingFile>,
    ) -> Result<CommittedFiles, StorageError> {
        let dir = self.entity_dir(entity);
        let created = !self.exists(entity).await?;
        fs::create_dir_all(&dir).await?;

        let moves: Vec<(PathBuf, PathBuf)> = cover
            .iter()
            .chain(audio.iter())
            .map(|incoming| (incoming.source.clone(), dir.join(&incoming.file.file_name)))
            .collect();
        if let Err(err) = commit_moves(&moves).await {
            if created && let Err(cleanup) = fs::remove_dir_all(&dir).await {
                warn!(path = ?dir, error = %cleanup, "failed to remove entity dir after failed commit");
            }
            return Err(err.into());
        }

        let mut meta = self.read_meta(entity).await;
        if let Some(cover) = &cover {
            self.clear_stale_covers(entity, &cover.file.file_name).await;
            meta.cover = Some(cover.file.clone());
        }
        if let (Entity::Track(..), [single]) = (entity, audio.as_slice()) {
            meta.audio = Some(single.file.clone());
        }
        if let Err(err) = self.write_meta(entity, &meta).await {
            warn!(entity = %entity.lock_key(), error = %err, "failed to record entity metadata");
        }

        Ok(CommittedFiles {
            cover: cover.map(|incoming| incoming.file.file_name),
            audio: audio
                .into_iter()
                .map(|incoming| incoming.file.file_name)
                .collect(),
        })
    }

    /// 删除除 `keep` 之外的所有 `cover.*` 文件。
    async fn clear_stale_covers(&self, entity: &Entity, keep: &str) {
        let files = match self.list_files(entity).await {
            Ok(Some(files)) => files,
            Ok(None) => return,
            Err(err) => {
                warn!(entity = %entity.lock_key(), error = %err, "failed to scan for stale covers");
                return;
            }
        };
        for name in files.iter().filter(|name| is_cover_name(name) && *name != keep) {
            let path = self.entity_file(entity, name);
            match fs::remove_file(&path).await {
                Ok(()) => debug!(path = ?path, "removed stale cover"),
                Err(err) => warn!(path = ?path, error = %err, "failed to remove stale cover"),
            }
        }
    }
}

/// 封面文件名：以 `cover.` 开头（忽略大小写）。
pub fn is_cover_name(name: &str) -> bool {
    name.len() > COVER_STEM.len() + 1
        && name
            .get(..COVER_STEM.len() + 1)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("cover."))
}

pub fn is_audio_name(name: &str) -> bool {
    let ext = extension_of(name);
    AUDIO_EXTENSIONS
        .iter()
        .any(|audio_ext| ext.eq_ignore_ascii_case(audio_ext))
}

/// 按顺序移动一批文件；任一步失败时撤销已完成的移动并恢复被覆盖的文件。
pub async fn commit_moves(moves: &[(PathBuf, PathBuf)]) -> io::Result<()> {
    let mut applied: Vec<AppliedMove> = Vec::with_capacity(moves.len());
    for (source, dest) in moves {
        match apply_move(source, dest).await {
            Ok(done) => applied.push(done),
            Err(err) => {
                warn!(source = ?source, dest = ?dest, error = %err, "move failed, rolling back batch");
                rollback(applied).await;
                return Err(err);
            }
        }
    }
    for done in applied {
        if let Some(backup) = done.backup
            && let Err(err) = fs::remove_file(&backup).await
        {
            warn!(path = ?backup, error = %err, "failed to remove commit backup");
        }
    }
    Ok(())
}

async fn apply_move(source: &Path, dest: &Path) -> io::Result<AppliedMove> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let backup = match fs::symlink_metadata(dest).await {
        Ok(metadata) if metadata.is_dir() => {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                "destination is a directory",
            ));
        }
        Ok(_) => {
            let backup = backup_path(dest);
            fs::rename(dest, &backup).await?;
            Some(backup)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => return Err(err),
    };
    if let Err(err) = move_file(source, dest).await {
        if let Some(backup) = &backup {
            let _ = fs::rename(backup, dest).await;
        }
        return Err(err);
    }
    Ok(AppliedMove {
        dest: dest.to_path_buf(),
        backup,
    })
}

async fn rollback(applied: Vec<AppliedMove>) {
    for done in applied.into_iter().rev() {
        if let Err(err) = fs::remove_file(&done.dest).await {
            warn!(path = ?done.dest, error = %err, "rollback: failed to remove moved file");
        }
        if let Some(backup) = done.backup
            && let Err(err) = fs::rename(&backup, &done.dest).await
        {
            warn!(path = ?done.dest, error = %err, "rollback: failed to restore previous file");
        }
    }
}

/// `rename`，跨文件系统时退化为复制后删除。
async fn move_file(source: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::CrossesDevices => {
            fs::copy(source, dest).await?;
            fs::remove_file(source).await
        }
        Err(err) => Err(err),
    }
}

fn backup_path(dest: &Path) -> PathBuf {
    let base = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{base}.bak.{}", Uuid::new_v4()))
}

fn is_missing(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory)
}

async fn list_entries(dir: &Path, dirs: bool) -> Result<Option<Vec<String>>, StorageError> {
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(err) if is_missing(&err) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().await?;
        if (dirs && file_type.is_dir()) || (!dirs && file_type.is_file()) {
            names.push(name);
        }
    }
    names.sort();
    Ok(Some(names))
}
