//! 由请求自身的方案与主机名生成文件的公开 URL。

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use chrono::Utc;
use std::convert::Infallible;

use crate::catalog::Entity;
use crate::http::{RequestScheme, request_scheme};

/// Scheme and host the client used to reach the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicOrigin {
    scheme: RequestScheme,
    host: String,
}

impl PublicOrigin {
    pub fn from_headers(
        headers: &HeaderMap,
        authority: Option<&str>,
        listener: RequestScheme,
    ) -> Self {
        let host = headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or(authority)
            .unwrap_or("localhost")
            .to_string();
        Self {
            scheme: request_scheme(headers, listener),
            host,
        }
    }

    /// `{scheme}://{host}/groups/.../{file}?v={millis}`
    pub fn file_url(&self, entity: &Entity, file_name: &str) -> String {
        let path = entity
            .segments()
            .into_iter()
            .chain(std::iter::once(file_name))
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}://{}/{}?v={}",
            self.scheme.as_str(),
            self.host,
            path,
            Utc::now().timestamp_millis()
        )
    }
}

impl<S> FromRequestParts<S> for PublicOrigin
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let listener = parts
            .extensions
            .get::<RequestScheme>()
            .copied()
            .unwrap_or(RequestScheme::Http);
        let authority = parts.uri.authority().map(|authority| authority.as_str());
        Ok(Self::from_headers(&parts.headers, authority, listener))
    }
}
