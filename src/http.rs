//! HTTP 辅助工具：请求方案识别、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::{middleware, response::Response};
use std::net::IpAddr;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestScheme {
    Http,
    Https,
}

impl RequestScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestScheme::Http => "http",
            RequestScheme::Https => "https",
        }
    }
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(AllowMethods::mirror_request())
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true),
    )
}

/// 从 `x-forwarded-for` 解析客户端 IP。
pub fn extract_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<IpAddr>().ok())
}

/// 综合转发头与连接信息计算客户端 IP。
pub fn resolve_client_ip(headers: &HeaderMap, connect_ip: Option<IpAddr>) -> Option<IpAddr> {
    extract_forwarded_ip(headers).or(connect_ip)
}

/// 请求的对外方案（含反向代理头）。
pub fn request_scheme(headers: &HeaderMap, scheme: RequestScheme) -> RequestScheme {
    match headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
    {
        Some(value) if value.eq_ignore_ascii_case("https") => RequestScheme::Https,
        Some(value) if value.eq_ignore_ascii_case("http") => RequestScheme::Http,
        _ => scheme,
    }
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

/// 拒绝访问以 `.` 开头的路径段（元数据与提交备份文件）。
pub async fn reject_hidden_paths(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    if has_hidden_segment(request.uri().path()) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(next.run(request).await)
}

fn has_hidden_segment(path: &str) -> bool {
    // Undecodable paths are refused too.
    let Ok(decoded) = urlencoding::decode(path) else {
        return true;
    };
    decoded
        .split(['/', '\\'])
        .any(|segment| segment.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_segments_are_detected_after_decoding() {
        assert!(has_hidden_segment("/G/.catalog.json"));
        assert!(has_hidden_segment("/G/%2Ecatalog.json"));
        assert!(has_hidden_segment("/G/Albums/LP/.cover.png.bak.1234"));
        assert!(has_hidden_segment("/G/..%2F..%2Fsecret"));
        assert!(!has_hidden_segment("/G/Albums/LP/cover.png"));
        assert!(!has_hidden_segment("/G/Tracks/Mr.%20Blue/Mr.%20Blue.mp3"));
    }

    #[test]
    fn forwarded_proto_overrides_listener_scheme() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_scheme(&headers, RequestScheme::Http), RequestScheme::Http);
        headers.insert("x-forwarded-proto", HeaderValue::from_static("HTTPS"));
        assert_eq!(request_scheme(&headers, RequestScheme::Http), RequestScheme::Https);
        headers.insert("x-forwarded-proto", HeaderValue::from_static("gopher"));
        assert_eq!(request_scheme(&headers, RequestScheme::Https), RequestScheme::Https);
    }

    #[test]
    fn forwarded_ip_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        let ip = resolve_client_ip(&headers, None).expect("ip");
        assert_eq!(ip.to_string(), "203.0.113.7");
    }

    #[test]
    fn cors_layer_requires_valid_origins() {
        assert!(build_cors_layer(None).is_none());
        assert!(build_cors_layer(Some(" , ")).is_none());
        assert!(build_cors_layer(Some("http://localhost:5173")).is_some());
    }
}
