//! 上传暂存区：每个请求独立的临时目录与过期清理。

use axum::extract::Multipart;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{COVER_STEM, IncomingFile, StoredFile, is_cover_name};
use crate::error::ApiError;
use crate::naming::{EntityName, extension_of, file_name_from_upload};

#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    ttl: Duration,
}

/// 一个已写入暂存目录的文件分段。
#[derive(Debug)]
pub struct StagedFile {
    pub field: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub path: PathBuf,
    pub size: u64,
}

/// 一次 multipart 请求的全部内容。
#[derive(Debug)]
pub struct StagedUpload {
    dir: PathBuf,
    fields: HashMap<String, String>,
    files: Vec<StagedFile>,
}

impl StagingArea {
    pub fn new(root: PathBuf, ttl: Duration) -> Self {
        Self { root, ttl }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// 将 multipart 请求写入新的暂存子目录。
    pub async fn receive(&self, mut multipart: Multipart) -> Result<StagedUpload, ApiError> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let mut upload = StagedUpload {
            dir,
            fields: HashMap::new(),
            files: Vec::new(),
        };
        match read_parts(&mut multipart, &mut upload).await {
            Ok(()) => {
                debug!(
                    dir = ?upload.dir,
                    fields = upload.fields.len(),
                    files = upload.files.len(),
                    "multipart staged"
                );
                Ok(upload)
            }
            Err(err) => {
                upload.discard().await;
                Err(err)
            }
        }
    }

    /// 清理过期的暂存子目录。
    pub async fn cleanup_stale(&self) -> io::Result<usize> {
        if self.ttl.is_zero() {
            return Ok(0);
        }
        if fs::metadata(&self.root).await.is_err() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };
            if age >= self.ttl {
                let path = entry.path();
                if let Err(err) = fs::remove_dir_all(&path).await {
                    warn!(path = ?path, error = %err, "failed to remove stale staging dir");
                } else {
                    info!(path = ?path, "removed stale staging dir");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

async fn read_parts(multipart: &mut Multipart, upload: &mut StagedUpload) -> Result<(), ApiError> {
    let mut index = 0u32;
    while let Some(mut field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let Some(original_name) = field.file_name().map(str::to_string) else {
            let value = field.text().await?;
            upload.fields.insert(name, value);
            continue;
        };
        let content_type = field.content_type().map(str::to_string);

        let path = upload.dir.join(format!("{index}.part"));
        index += 1;
        let mut file = File::create(&path)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let mut size: u64 = 0;
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|err| ApiError::Internal(err.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        drop(file);

        // Browsers send an empty part for an unselected file input.
        if size == 0 {
            let _ = fs::remove_file(&path).await;
            continue;
        }
        upload.files.push(StagedFile {
            field: name,
            original_name,
            content_type,
            path,
            size,
        });
    }
    Ok(())
}

impl StagedUpload {
    /// 读取去除首尾空白后非空的文本字段。
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    /// 必填的实体名称字段：缺失或非法均返回 400。
    pub fn required_name(&self, name: &str) -> Result<EntityName, ApiError> {
        let value = self
            .text(name)
            .ok_or_else(|| ApiError::BadRequest(format!("{name} is required")))?;
        Ok(EntityName::parse(value)?)
    }

    pub fn take_file(&mut self, name: &str) -> Option<StagedFile> {
        let index = self.files.iter().position(|file| file.field == name)?;
        Some(self.files.remove(index))
    }

    /// 取出字段名属于 `names` 的全部文件，保持上传顺序。
    pub fn take_files(&mut self, names: &[&str]) -> Vec<StagedFile> {
        let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.files)
            .into_iter()
            .partition(|file| names.contains(&file.field.as_str()));
        self.files = rest;
        taken
    }

    /// 删除本次请求的暂存目录。
    pub async fn discard(self) {
        if let Err(err) = fs::remove_dir_all(&self.dir).await
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(dir = ?self.dir, error = %err, "failed to remove staging dir");
        }
    }
}

impl StagedFile {
    /// 作为封面提交：目标文件名为 `cover{ext}`。
    pub fn into_cover(self) -> IncomingFile {
        let mut ext = file_name_from_upload(&self.original_name)
            .map(|name| extension_of(&name).to_string())
            .unwrap_or_default();
        if ext.is_empty() {
            ext = self
                .content_type
                .as_deref()
                .and_then(mime_guess::get_mime_extensions_str)
                .and_then(|exts| exts.first())
                .map(|ext| format!(".{ext}"))
                .unwrap_or_else(|| ".bin".to_string());
        }
        let file_name = format!("{COVER_STEM}{ext}");
        IncomingFile {
            file: StoredFile::new(&file_name, self.content_type.as_deref()),
            source: self.path,
        }
    }

    /// 作为音频提交：保留客户端原始文件名。
    pub fn into_audio(self) -> Result<IncomingFile, ApiError> {
        let file_name = file_name_from_upload(&self.original_name)?;
        if is_cover_name(&file_name) {
            return Err(ApiError::BadRequest(format!(
                "audio file name is reserved for covers: {file_name}"
            )));
        }
        Ok(IncomingFile {
            file: StoredFile::new(&file_name, self.content_type.as_deref()),
            source: self.path,
        })
    }
}
