//! Static file serving from the project root
//!
//! Resolution order for a request path: existing file, directory index,
//! SPA fallback to the root index.html (when enabled), then the 404 page.
//! HTML goes through the live-reload injector on the way out.

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::path::{Component, Path, PathBuf};

use super::inject::inject;

/// Extensions that get a long-lived cache header
const ASSET_EXTENSIONS: &[&str] = &[
    "css", "js", "mjs", "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "bmp", "ico",
];

const NOT_FOUND_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>404 Not Found</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 600px;
            margin: 80px auto;
            padding: 20px;
            color: #333;
        }
        h1 { color: #dc2626; }
    </style>
</head>
<body>
    <h1>404 Not Found</h1>
    <p>The requested resource does not exist in the served directory.</p>
</body>
</html>"#;

/// Outcome of resolving a request path against the project root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// An existing regular file
    File(PathBuf),
    /// `index.html` inside a requested directory
    DirectoryIndex(PathBuf),
    /// Root `index.html` served for an unresolved path
    SpaFallback(PathBuf),
    NotFound,
}

impl Resolution {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::File(p) | Resolution::DirectoryIndex(p) | Resolution::SpaFallback(p) => {
                Some(p)
            }
            Resolution::NotFound => None,
        }
    }
}

/// Map a URL path onto the project root.
///
/// Returns `None` for undecodable paths and paths that try to climb out of
/// the root.
pub fn sanitize_request_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(request_path).ok()?;
    let mut resolved = root.to_path_buf();
    for segment in decoded.split(['/', '\\']) {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." {
            return None;
        }
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(part)), None) => resolved.push(part),
            _ => return None,
        }
    }
    Some(resolved)
}

/// Decide what to serve for a request path
pub async fn resolve(root: &Path, request_path: &str, spa_mode: bool) -> Resolution {
    if let Some(target) = sanitize_request_path(root, request_path) {
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => return Resolution::File(target),
            Ok(meta) if meta.is_dir() => {
                let index = target.join("index.html");
                if is_file(&index).await {
                    return Resolution::DirectoryIndex(index);
                }
            }
            _ => {}
        }
    } else {
        log::debug!("Rejected request path outside root: {}", request_path);
    }

    if spa_mode {
        let index = root.join("index.html");
        if is_file(&index).await {
            return Resolution::SpaFallback(index);
        }
    }

    Resolution::NotFound
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn is_html(path: &Path) -> bool {
    matches!(extension_of(path).as_str(), "html" | "htm")
}

/// Cache policy for a served file
pub fn cache_control_for(path: &Path) -> &'static str {
    if ASSET_EXTENSIONS.contains(&extension_of(path).as_str()) {
        "public, max-age=31536000"
    } else {
        "no-cache"
    }
}

/// Serve a request path from the project root
pub async fn serve_path(
    root: &Path,
    request_path: &str,
    spa_mode: bool,
    show_overlay: bool,
) -> Response {
    let resolution = resolve(root, request_path, spa_mode).await;
    log::debug!("{} -> {:?}", request_path, resolution);

    match resolution.path() {
        Some(path) => serve_file(path, show_overlay).await,
        None => not_found(),
    }
}

/// Serve a specific file, injecting the live-reload client into HTML
async fn serve_file(path: &Path, show_overlay: bool) -> Response {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("Failed to read {}: {}", path.display(), e);
            return not_found();
        }
    };

    let cache_control = cache_control_for(path);

    if is_html(path) {
        let html = String::from_utf8_lossy(&bytes);
        let body = inject(&html, show_overlay);
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "text/html; charset=utf-8"),
                (header::CACHE_CONTROL, cache_control),
            ],
            body,
        )
            .into_response();
    }

    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime_type),
            (header::CACHE_CONTROL, cache_control.to_string()),
        ],
        Body::from(bytes),
    )
        .into_response()
}

/// The fixed 404 page
pub fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        NOT_FOUND_PAGE,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("index.html"),
            "<html><head></head><body>root</body></html>",
        )
        .unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(
            dir.path().join("docs/index.html"),
            "<html><head></head><body>docs</body></html>",
        )
        .unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("style.css"), "body{}").unwrap();
        dir
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        let root = Path::new("/srv/site");
        assert_eq!(
            sanitize_request_path(root, "/css/a.css"),
            Some(PathBuf::from("/srv/site/css/a.css"))
        );
        assert_eq!(
            sanitize_request_path(root, "/my%20page.html"),
            Some(PathBuf::from("/srv/site/my page.html"))
        );
        assert_eq!(sanitize_request_path(root, "/../etc/passwd"), None);
        assert_eq!(sanitize_request_path(root, "/a/%2e%2e/%2e%2e/x"), None);
        assert_eq!(sanitize_request_path(root, "/"), Some(PathBuf::from("/srv/site")));
    }

    #[tokio::test]
    async fn test_resolve_precedence() {
        let dir = site();
        let root = dir.path();

        assert_eq!(
            resolve(root, "/style.css", false).await,
            Resolution::File(root.join("style.css"))
        );
        assert_eq!(
            resolve(root, "/", false).await,
            Resolution::DirectoryIndex(root.join("index.html"))
        );
        assert_eq!(
            resolve(root, "/docs", false).await,
            Resolution::DirectoryIndex(root.join("docs/index.html"))
        );
        assert_eq!(resolve(root, "/empty", false).await, Resolution::NotFound);
        assert_eq!(resolve(root, "/missing/route", false).await, Resolution::NotFound);
        assert_eq!(
            resolve(root, "/missing/route", true).await,
            Resolution::SpaFallback(root.join("index.html"))
        );
        assert_eq!(
            resolve(root, "/../secret", true).await,
            Resolution::SpaFallback(root.join("index.html"))
        );
    }

    #[tokio::test]
    async fn test_spa_without_root_index_is_404() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve(dir.path(), "/app", true).await, Resolution::NotFound);
    }

    #[test]
    fn test_cache_control() {
        assert_eq!(cache_control_for(Path::new("a.css")), "public, max-age=31536000");
        assert_eq!(cache_control_for(Path::new("logo.PNG")), "public, max-age=31536000");
        assert_eq!(cache_control_for(Path::new("favicon.ico")), "public, max-age=31536000");
        assert_eq!(cache_control_for(Path::new("index.html")), "no-cache");
        assert_eq!(cache_control_for(Path::new("data.json")), "no-cache");
    }

    #[tokio::test]
    async fn test_serve_path_injects_html() {
        let dir = site();
        let response = serve_path(dir.path(), "/", false, true).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains(crate::server::inject::INJECTION_MARKER));
        assert!(body.contains("root"));
    }

    #[tokio::test]
    async fn test_serve_path_not_found() {
        let dir = site();
        let response = serve_path(dir.path(), "/nope.txt", false, true).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
