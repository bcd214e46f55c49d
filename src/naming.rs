//! 实体名称与上传文件名校验。
//!
//! Names supplied by clients end up as directory and file names inside the
//! catalog, so each one must be exactly one normal path component.

use std::fmt;

const MAX_NAME_BYTES: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    Empty,
    Reserved(String),
    Separator(String),
    TooLong,
}

impl fmt::Display for NameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameError::Empty => write!(f, "name is empty"),
            NameError::Reserved(name) => write!(f, "name is reserved: {name}"),
            NameError::Separator(name) => write!(f, "name contains a path separator: {name}"),
            NameError::TooLong => write!(f, "name exceeds {MAX_NAME_BYTES} bytes"),
        }
    }
}

impl std::error::Error for NameError {}

/// 经过校验的组、专辑或曲目名称。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityName(String);

impl EntityName {
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        validate_component(raw.trim()).map(|name| Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 从客户端文件名中取最后一段并校验。
pub fn file_name_from_upload(raw: &str) -> Result<String, NameError> {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    validate_component(last.trim()).map(str::to_string)
}

/// 返回 `.ext` 形式的扩展名，没有扩展名时返回空串。
pub fn extension_of(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(0) | None => "",
        Some(index) => &file_name[index..],
    }
}

/// 去掉扩展名后的文件名。
pub fn stem_of(file_name: &str) -> &str {
    let ext = extension_of(file_name);
    &file_name[..file_name.len() - ext.len()]
}

fn validate_component(name: &str) -> Result<&str, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(NameError::TooLong);
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(NameError::Separator(name.to_string()));
    }
    // Dotfiles hold catalog metadata and commit backups.
    if name.starts_with('.') {
        return Err(NameError::Reserved(name.to_string()));
    }
    Ok(name)
}
