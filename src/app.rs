//! Axum 路由装配：API、静态文件与中间件。

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::{HeaderValue, Request, header};
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info_span};

use crate::catalog::CatalogStore;
use crate::http::{add_security_headers, build_cors_layer, reject_hidden_paths, resolve_client_ip};
use crate::locking::EntityLocks;
use crate::staging::StagingArea;
use crate::{albums, groups, tracks, version};

/// Shared services handed to every handler as request extensions.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogStore>,
    pub staging: Arc<StagingArea>,
    pub locks: Arc<EntityLocks>,
    pub upload_max_size: u64,
    pub cors_origins: Option<String>,
}

pub fn build_router(state: &AppState) -> Router {
    let body_limit = if state.upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(state.upload_max_size).unwrap_or(usize::MAX))
    };

    let uploads = Router::new()
        .route("/uploadAlbum", post(albums::upload_album))
        .route("/addTrack/{group_name}/{album_name}", post(albums::add_track))
        .route("/uploadGroupCover", post(groups::upload_group_cover))
        .route("/uploadTrack", post(tracks::upload_track))
        .layer(body_limit);

    let group_files = Router::new()
        .nest_service("/groups", ServeDir::new(state.catalog.groups_root()))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
        .layer(middleware::from_fn(reject_hidden_paths));
    let static_files = Router::new()
        .nest_service("/static", ServeDir::new(state.catalog.root_path()))
        .layer(middleware::from_fn(reject_hidden_paths));

    let mut app = Router::new()
        .route("/albumCovers/{group_name}", get(albums::album_covers))
        .route(
            "/album-tracks/{group_name}/{album_name}",
            get(albums::album_tracks),
        )
        .route(
            "/deleteAlbum/{group_name}/{album_name}",
            delete(albums::delete_album),
        )
        // Both deleteTrack shapes share the second segment name; extraction is positional.
        .route(
            "/deleteTrack/{group_name}/{name}/{track_name}",
            delete(albums::delete_album_track),
        )
        .route("/groupCover/{group_name}", get(groups::group_cover))
        .route("/groupCover/{group_name}/file", get(groups::group_cover_file))
        .route("/tracks/{group_name}", get(tracks::list_tracks))
        .route("/allTracks/{group_name}", get(tracks::all_tracks))
        .route(
            "/trackInfo/{group_name}/{track_name}",
            get(tracks::track_info),
        )
        .route(
            "/deleteTrack/{group_name}/{name}",
            delete(tracks::delete_track),
        )
        .route("/api/version", get(version::get_version_info))
        .merge(uploads)
        .merge(group_files)
        .merge(static_files)
        .layer(middleware::from_fn(add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(state.catalog.clone()))
        .layer(Extension(state.staging.clone()))
        .layer(Extension(state.locks.clone()));

    if let Some(cors_layer) = build_cors_layer(state.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }
    app
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "catalog-test-boundary";
    const HOST: &str = "catalog.test:4001";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a [u8]),
    }

    struct TestApp {
        _temp: tempfile::TempDir,
        router: Router,
        groups: std::path::PathBuf,
        staging: std::path::PathBuf,
    }

    fn make_app() -> TestApp {
        let temp = tempdir().expect("tempdir");
        let static_root = temp.path().join("static");
        let staging_root = temp.path().join("tmp");
        std::fs::create_dir_all(static_root.join("groups")).expect("create groups");
        std::fs::create_dir_all(&staging_root).expect("create staging");
        let state = AppState {
            catalog: Arc::new(CatalogStore::new(static_root.clone())),
            staging: Arc::new(StagingArea::new(
                staging_root.clone(),
                Duration::from_secs(3600),
            )),
            locks: Arc::new(EntityLocks::new(Duration::from_secs(1))),
            upload_max_size: 1024 * 1024,
            cors_origins: None,
        };
        TestApp {
            router: build_router(&state),
            groups: static_root.join("groups"),
            staging: staging_root,
            _temp: temp,
        }
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                            .as_bytes(),
                    );
                }
                Part::File(name, file_name, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                    body.extend_from_slice(b"\r\n");
                }
            }
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::HOST, HOST)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .expect("request")
    }

    fn plain_request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::HOST, HOST)
            .body(Body::empty())
            .expect("request")
    }

    async fn send_raw(app: &TestApp, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, body.to_vec())
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let (status, body) = send_raw(app, request).await;
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).expect("json body")
        };
        (status, value)
    }

    /// Strips origin and cache buster, leaving the path the static mount serves.
    fn served_path(url: &str) -> &str {
        let without_origin = url
            .strip_prefix(&format!("http://{HOST}"))
            .expect("url uses request host");
        without_origin.split('?').next().expect("path")
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    async fn upload_album(app: &TestApp, group: &str, title: &str) -> (StatusCode, Value) {
        send(
            app,
            multipart_request(
                "/uploadAlbum",
                &[
                    Part::Text("groupName", group),
                    Part::Text("title", title),
                    Part::File("cover", "art.png", b"png-bytes"),
                    Part::File("tracks", "a.mp3", b"aaa"),
                    Part::File("tracks", "b.mp3", b"bbb"),
                ],
            ),
        )
        .await
    }

    async fn upload_track(app: &TestApp, group: &str, track: &str, audio: &[u8]) -> (StatusCode, Value) {
        send(
            app,
            multipart_request(
                "/uploadTrack",
                &[
                    Part::Text("groupName", group),
                    Part::Text("trackName", track),
                    Part::File("cover", "front.jpg", b"jpg"),
                    Part::File("audio", &format!("{track}.mp3"), audio),
                ],
            ),
        )
        .await
    }

    #[tokio::test]
    async fn group_cover_url_serves_uploaded_bytes() {
        let app = make_app();
        let (status, body) = send(
            &app,
            multipart_request(
                "/uploadGroupCover",
                &[
                    Part::Text("groupName", "The Band"),
                    Part::File("icon", "logo.png", b"\x89PNG-logo"),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().expect("url").contains("/groups/The%20Band/cover.png?v="));

        let (status, body) = send(&app, plain_request(Method::GET, "/groupCover/The%20Band")).await;
        assert_eq!(status, StatusCode::OK);
        let cover_url = body["coverUrl"].as_str().expect("coverUrl");

        let (status, bytes) =
            send_raw(&app, plain_request(Method::GET, served_path(cover_url))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"\x89PNG-logo");

        let (status, bytes) =
            send_raw(&app, plain_request(Method::GET, "/groupCover/The%20Band/file")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(bytes, b"\x89PNG-logo");
    }

    #[tokio::test]
    async fn second_group_cover_leaves_single_cover_file() {
        let app = make_app();
        for (file_name, data) in [("a.jpg", b"first".as_slice()), ("b.png", b"second".as_slice())] {
            let (status, _) = send(
                &app,
                multipart_request(
                    "/uploadGroupCover",
                    &[
                        Part::Text("groupName", "G"),
                        Part::File("icon", file_name, data),
                    ],
                ),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }

        let covers: Vec<String> = file_names(&app.groups.join("G"))
            .into_iter()
            .filter(|name| name.starts_with("cover."))
            .collect();
        assert_eq!(covers, vec!["cover.png".to_string()]);
        assert_eq!(
            std::fs::read(app.groups.join("G/cover.png")).expect("read"),
            b"second"
        );
    }

    #[tokio::test]
    async fn group_cover_missing_is_not_found() {
        let app = make_app();
        let (status, body) = send(&app, plain_request(Method::GET, "/groupCover/Nobody")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn duplicate_track_upload_conflicts_without_changes() {
        let app = make_app();
        let (status, body) = upload_track(&app, "A", "T", b"original").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["audioUrl"].as_str().expect("audioUrl").contains("/groups/A/Tracks/T/T.mp3"));

        let (status, _) = upload_track(&app, "A", "T", b"replacement").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            std::fs::read(app.groups.join("A/Tracks/T/T.mp3")).expect("read"),
            b"original"
        );
        assert!(file_names(&app.staging).is_empty(), "staging must be emptied");
    }

    #[tokio::test]
    async fn delete_missing_album_is_idempotent() {
        let app = make_app();
        let before = file_names(&app.groups);
        let (status, body) = send(&app, plain_request(Method::DELETE, "/deleteAlbum/G/Nothing")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].is_string());
        assert_eq!(file_names(&app.groups), before);
    }

    #[tokio::test]
    async fn tracks_listing_skips_entries_without_audio() {
        let app = make_app();
        assert_eq!(upload_track(&app, "G", "T1", b"1").await.0, StatusCode::OK);
        assert_eq!(upload_track(&app, "G", "T2", b"2").await.0, StatusCode::OK);
        std::fs::create_dir_all(app.groups.join("G/Tracks/Broken")).expect("mkdir");
        std::fs::write(app.groups.join("G/Tracks/Broken/cover.png"), b"c").expect("write");

        let (status, body) = send(&app, plain_request(Method::GET, "/tracks/G")).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body.as_array().expect("array");
        let names: Vec<&str> = entries
            .iter()
            .map(|entry| entry["trackName"].as_str().expect("trackName"))
            .collect();
        assert_eq!(names, ["T1", "T2"]);
        assert!(entries.iter().all(|entry| entry["audioUrl"].is_string()));

        let (status, body) = send(&app, plain_request(Method::GET, "/tracks/G?albumName=T2")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().expect("array").len(), 1);

        let (status, body) = send(&app, plain_request(Method::GET, "/tracks/Unknown")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Array(Vec::new()));
    }

    #[tokio::test]
    async fn album_round_trip_lists_cover_and_tracks() {
        let app = make_app();
        let (status, body) = upload_album(&app, "G", "First Album").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tracksUrls"].as_array().expect("urls").len(), 2);

        let (status, body) =
            send(&app, plain_request(Method::GET, "/album-tracks/G/First%20Album")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["albumName"], "First Album");
        assert!(served_path(body["coverUrl"].as_str().expect("cover")).ends_with("cover.png"));
        let mut names: Vec<&str> = body["tracks"]
            .as_array()
            .expect("tracks")
            .iter()
            .map(|track| track["trackName"].as_str().expect("name"))
            .collect();
        names.sort();
        assert_eq!(names, ["a", "b"]);

        let (status, body) = send(&app, plain_request(Method::GET, "/albumCovers/G")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["albumTitle"], "First Album");
    }

    #[tokio::test]
    async fn album_track_add_lookup_and_delete() {
        let app = make_app();
        assert_eq!(upload_album(&app, "G", "LP").await.0, StatusCode::OK);

        let (status, body) = send(
            &app,
            multipart_request("/addTrack/G/LP", &[Part::File("track", "Bonus.mp3", b"bonus")]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["trackUrl"].as_str().expect("url").contains("/Albums/LP/Bonus.mp3"));

        let (status, body) = send(&app, plain_request(Method::GET, "/trackInfo/G/bonus")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["audioUrl"].as_str().expect("audio").contains("Bonus.mp3"));
        assert!(body["coverUrl"].as_str().expect("cover").contains("cover.png"));

        let (status, body) = send(&app, plain_request(Method::GET, "/allTracks/G")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().expect("array").len(), 3);
        assert_eq!(body[0]["albumName"], "LP");

        let (status, _) = send(&app, plain_request(Method::DELETE, "/deleteTrack/G/LP/Bonus")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            file_names(&app.groups.join("G/Albums/LP"))
                .into_iter()
                .filter(|name| !name.starts_with('.'))
                .collect::<Vec<_>>(),
            ["a.mp3", "b.mp3", "cover.png"]
        );

        let (status, _) = send(&app, plain_request(Method::DELETE, "/deleteTrack/G/LP/Bonus")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, plain_request(Method::GET, "/trackInfo/G/Bonus")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn add_track_requires_existing_album() {
        let app = make_app();
        let (status, _) = send(
            &app,
            multipart_request("/addTrack/G/Missing", &[Part::File("track", "x.mp3", b"x")]),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!app.groups.join("G/Albums/Missing").exists());
    }

    #[tokio::test]
    async fn standalone_track_delete_and_all_tracks_without_albums() {
        let app = make_app();
        assert_eq!(upload_track(&app, "G", "Solo", b"s").await.0, StatusCode::OK);

        let (status, body) = send(&app, plain_request(Method::GET, "/trackInfo/G/Solo")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["coverUrl"].as_str().expect("cover").contains("/Tracks/Solo/cover.jpg"));

        let (status, _) = send(&app, plain_request(Method::GET, "/allTracks/G")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, plain_request(Method::DELETE, "/deleteTrack/G/Solo")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!app.groups.join("G/Tracks/Solo").exists());
        let (status, _) = send(&app, plain_request(Method::DELETE, "/deleteTrack/G/Solo")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_parts_and_unsafe_names_are_rejected() {
        let app = make_app();
        let (status, body) = send(
            &app,
            multipart_request(
                "/uploadAlbum",
                &[
                    Part::Text("groupName", "G"),
                    Part::Text("title", "T"),
                    Part::File("cover", "c.png", b"c"),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().expect("error").contains("track"));

        let (status, _) = send(
            &app,
            multipart_request(
                "/uploadGroupCover",
                &[
                    Part::Text("groupName", ".."),
                    Part::File("icon", "c.png", b"c"),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, plain_request(Method::DELETE, "/deleteAlbum/G/..")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(file_names(&app.groups).is_empty());
        assert!(file_names(&app.staging).is_empty());
    }

    #[tokio::test]
    async fn responses_carry_security_headers() {
        let app = make_app();
        let response = app
            .router
            .clone()
            .oneshot(plain_request(Method::GET, "/api/version"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::X_FRAME_OPTIONS),
            Some(&HeaderValue::from_static("DENY"))
        );
    }

    #[tokio::test]
    async fn empty_file_part_counts_as_missing() {
        let app = make_app();
        let (status, body) = send(
            &app,
            multipart_request(
                "/uploadGroupCover",
                &[
                    Part::Text("groupName", "G"),
                    Part::File("icon", "", b""),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().expect("error").contains("icon"));
        assert!(file_names(&app.groups).is_empty());
        assert!(file_names(&app.staging).is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_with_413() {
        let app = make_app();
        let audio = vec![0u8; 2 * 1024 * 1024];
        let (status, body) = send(
            &app,
            multipart_request(
                "/uploadTrack",
                &[
                    Part::Text("groupName", "G"),
                    Part::Text("trackName", "Big"),
                    Part::File("cover", "c.png", b"c"),
                    Part::File("audio", "Big.mp3", &audio),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["error"], "upload too large");
        assert!(file_names(&app.groups).is_empty());
        assert!(file_names(&app.staging).is_empty());
    }

    #[tokio::test]
    async fn static_mounts_hide_dotfiles() {
        let app = make_app();
        let (status, _) = send(
            &app,
            multipart_request(
                "/uploadGroupCover",
                &[
                    Part::Text("groupName", "G"),
                    Part::File("icon", "logo.png", b"png"),
                ],
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(app.groups.join("G/.catalog.json").exists());

        for uri in [
            "/groups/G/.catalog.json",
            "/groups/G/%2Ecatalog.json",
            "/static/groups/G/.catalog.json",
        ] {
            let (status, _) = send_raw(&app, plain_request(Method::GET, uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
        let (status, body) = send_raw(&app, plain_request(Method::GET, "/groups/G/cover.png")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"png");
    }
}
