use std::{fs, path::Path};

use assetline::{
    ReloadHub,
    server::{CLIENT_SCRIPT_PATH, DevServer},
};
use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use pretty_assertions::assert_eq;
use tower::ServiceExt;

async fn get(dir: &tempfile::TempDir, uri: &str) -> (StatusCode, Option<String>, String) {
    get_from(dir.path(), uri).await
}

async fn get_from(root: &Path, uri: &str) -> (StatusCode, Option<String>, String) {
    let app = DevServer::router(root.to_path_buf(), ReloadHub::new());
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let length: Option<usize> = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .map(|v| v.to_str().unwrap().parse().unwrap());

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    if let Some(length) = length {
        assert_eq!(length, body.len(), "Content-Length must match the sent body");
    }

    (status, content_type, String::from_utf8_lossy(&body).into_owned())
}

#[tokio::test]
async fn directory_index_gets_the_reload_client() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("index.html"), "<html><body><h1>Home</h1></body></html>").unwrap();

    let (status, content_type, body) = get(&dir, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/html"));
    assert!(body.contains(CLIENT_SCRIPT_PATH), "{}", body);
    assert!(body.ends_with("</body></html>"), "{}", body);
}

#[tokio::test]
async fn stylesheets_are_served_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("css")).unwrap();
    fs::write(dir.path().join("css/app.css"), ".a{color:red}").unwrap();

    let (status, content_type, body) = get(&dir, "/css/app.css").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/css"));
    assert_eq!(body, ".a{color:red}");
}

#[tokio::test]
async fn missing_files_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (status, _, _) = get(&dir, "/nope.html").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn paths_outside_the_root_are_not_served() {
    let dir = tempfile::tempdir().unwrap();
    let site = dir.path().join("site");
    fs::create_dir_all(site.join("css")).unwrap();
    fs::write(dir.path().join("secret.txt"), "secret").unwrap();

    for uri in ["/../secret.txt", "/css/%2e%2e/%2e%2e/secret.txt"] {
        let (status, _, body) = get_from(&site, uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", uri);
        assert!(!body.contains("secret"), "{}", uri);
    }
}

#[tokio::test]
async fn file_responses_are_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("about.html"), "<p>about</p>").unwrap();

    let app = DevServer::router(dir.path().to_path_buf(), ReloadHub::new());
    let response = app
        .oneshot(Request::builder().uri("/about.html").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );
}

#[tokio::test]
async fn client_script_is_built_in() {
    let dir = tempfile::tempdir().unwrap();
    let (status, content_type, body) = get(&dir, CLIENT_SCRIPT_PATH).await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/javascript"));
    assert!(body.contains("WebSocket"));
}
