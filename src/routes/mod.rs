//! Route table for Vessel Server
//!
//! Every endpoint is a variant of [`Endpoint`]. The router is built from
//! [`Endpoint::ALL`]; the table is checked for duplicate `(method, path)`
//! pairs before anything is registered.

pub mod agent;
pub mod auth;
pub mod extract;
pub mod health;
pub mod upload;

use std::any::Any;
use std::collections::{BTreeMap, HashSet};

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware,
    response::{IntoResponse, Response},
    routing::{on, MethodFilter, MethodRouter},
    Router,
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::event_log::record_errors;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Health,
    Activate,
    Login,
    Logout,
    RefreshToken,
    Heartbeat,
    Settings,
    InitUpload,
    UploadStatus,
    UploadPart,
    CompleteUpload,
    AbortUpload,
    UploadFile,
}

impl Endpoint {
    pub const ALL: [Endpoint; 13] = [
        Endpoint::Health,
        Endpoint::Activate,
        Endpoint::Login,
        Endpoint::Logout,
        Endpoint::RefreshToken,
        Endpoint::Heartbeat,
        Endpoint::Settings,
        Endpoint::InitUpload,
        Endpoint::UploadStatus,
        Endpoint::UploadPart,
        Endpoint::CompleteUpload,
        Endpoint::AbortUpload,
        Endpoint::UploadFile,
    ];

    pub fn method(self) -> Method {
        match self {
            Endpoint::Health | Endpoint::Settings | Endpoint::UploadStatus => Method::GET,
            Endpoint::UploadPart => Method::PUT,
            Endpoint::AbortUpload => Method::DELETE,
            Endpoint::Activate
            | Endpoint::Login
            | Endpoint::Logout
            | Endpoint::RefreshToken
            | Endpoint::Heartbeat
            | Endpoint::InitUpload
            | Endpoint::CompleteUpload
            | Endpoint::UploadFile => Method::POST,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Health => "/health",
            Endpoint::Activate => "/activate",
            Endpoint::Login => "/login",
            Endpoint::Logout => "/logout",
            Endpoint::RefreshToken => "/token/refresh",
            Endpoint::Heartbeat => "/heartbeat",
            Endpoint::Settings => "/settings",
            Endpoint::InitUpload => "/upload",
            Endpoint::UploadStatus | Endpoint::UploadPart | Endpoint::AbortUpload => "/upload/:id",
            Endpoint::CompleteUpload => "/upload/:id/complete",
            Endpoint::UploadFile => "/file",
        }
    }

    /// Endpoints whose handler receives the resolved caller
    pub fn resolves_session(self) -> bool {
        !matches!(
            self,
            Endpoint::Health | Endpoint::Activate | Endpoint::RefreshToken
        )
    }

    fn handler(self, filter: MethodFilter) -> MethodRouter<AppState> {
        match self {
            Endpoint::Health => on(filter, health::health_check),
            Endpoint::Activate => on(filter, auth::activate),
            Endpoint::Login => on(filter, auth::login),
            Endpoint::Logout => on(filter, auth::logout),
            Endpoint::RefreshToken => on(filter, auth::refresh_token),
            Endpoint::Heartbeat => on(filter, agent::heartbeat),
            Endpoint::Settings => on(filter, agent::settings),
            Endpoint::InitUpload => on(filter, upload::init_upload),
            Endpoint::UploadStatus => on(filter, upload::upload_status),
            Endpoint::UploadPart => on(filter, upload::upload_part),
            Endpoint::CompleteUpload => on(filter, upload::complete_upload),
            Endpoint::AbortUpload => on(filter, upload::abort_upload),
            Endpoint::UploadFile => on(filter, upload::upload_file),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteTableError {
    #[error("Route registered twice: {method} {path}")]
    Duplicate { method: Method, path: &'static str },

    #[error("Unsupported method {method} for {path}")]
    UnsupportedMethod { method: Method, path: &'static str },
}

/// Reject a table that maps one `(method, path)` to two endpoints
pub fn check_endpoints(endpoints: &[Endpoint]) -> Result<(), RouteTableError> {
    let mut seen = HashSet::new();

    for endpoint in endpoints {
        if !seen.insert((endpoint.method(), endpoint.path())) {
            return Err(RouteTableError::Duplicate {
                method: endpoint.method(),
                path: endpoint.path(),
            });
        }
    }

    Ok(())
}

/// Build the application router
pub fn router(state: AppState) -> Result<Router, RouteTableError> {
    check_endpoints(&Endpoint::ALL)?;

    let mut by_path: BTreeMap<&'static str, MethodRouter<AppState>> = BTreeMap::new();

    for endpoint in Endpoint::ALL {
        let filter = MethodFilter::try_from(endpoint.method()).map_err(|_| {
            RouteTableError::UnsupportedMethod {
                method: endpoint.method(),
                path: endpoint.path(),
            }
        })?;

        let mut method_router = endpoint.handler(filter);
        if endpoint.resolves_session() {
            method_router = method_router.layer(middleware::from_fn_with_state(
                state.clone(),
                extract::resolve_session,
            ));
        }

        let merged = match by_path.remove(endpoint.path()) {
            Some(existing) => existing.merge(method_router),
            None => method_router,
        };
        by_path.insert(endpoint.path(), merged);
    }

    let mut app = Router::new();
    for (path, method_router) in by_path {
        app = app.route(path, method_router.fallback(method_not_allowed));
    }

    let body_limit = state.config().server.max_part_bytes;

    Ok(app
        .fallback(unknown_route)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(
            state.event_log().clone(),
            record_errors,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

async fn unknown_route() -> AppError {
    AppError::NotFound("No such endpoint".into())
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");

    AppError::Backend(format!("handler panicked: {}", detail)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header, HeaderMap, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::db;
    use crate::storage::{LocalStorage, StorageRegistry};

    struct TestApp {
        app: Router,
        state: AppState,
        _dir: TempDir,
    }

    async fn test_app_with(config: Config) -> TestApp {
        let dir = TempDir::new().unwrap();
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        let storage = StorageRegistry::new()
            .with_adapter(Arc::new(LocalStorage::new(dir.path().to_path_buf())));

        let state = AppState::new(config, pool, storage);
        let app = router(state.clone()).unwrap();

        TestApp {
            app,
            state,
            _dir: dir,
        }
    }

    async fn test_app() -> TestApp {
        test_app_with(Config::default()).await
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn empty_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn part_request(upload_id: &str, part: u32, token: &str, data: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/upload/{}", upload_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header("X-Part-Number", part.to_string())
            .body(Body::from(data))
            .unwrap()
    }

    /// Create and activate an agent; returns `(access_token, refresh_token, user_id)`
    async fn activated_agent(test: &TestApp, name: &str) -> (String, String, String) {
        test.state
            .users()
            .create_user(name, "secret-pw", "ACT-42")
            .await
            .unwrap();

        let (status, _, body) = send(
            &test.app,
            json_request(
                "POST",
                "/activate",
                None,
                json!({ "user_name": name, "activation_code": "ACT-42" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_activated"], true);

        (
            body["access_token"].as_str().unwrap().to_string(),
            body["refresh_token"].as_str().unwrap().to_string(),
            body["user_id"].as_str().unwrap().to_string(),
        )
    }

    fn cookie_value(headers: &HeaderMap) -> Option<String> {
        headers
            .get(header::SET_COOKIE)?
            .to_str()
            .ok()?
            .split(';')
            .next()
            .map(str::to_string)
    }

    #[test]
    fn test_endpoint_table_is_unique() {
        assert!(check_endpoints(&Endpoint::ALL).is_ok());
        assert!(matches!(
            check_endpoints(&[Endpoint::Health, Endpoint::Settings, Endpoint::Health]),
            Err(RouteTableError::Duplicate { path: "/health", .. })
        ));
    }

    #[tokio::test]
    async fn test_health() {
        let test = test_app().await;
        let (status, headers, body) = send(&test.app, empty_request("GET", "/health", None)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert!(headers.get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_part_upload_is_401_with_flags() {
        let test = test_app().await;
        let request = Request::builder()
            .method("PUT")
            .uri(format!("/upload/{}", uuid::Uuid::new_v4()))
            .header("X-Part-Number", "1")
            .body(Body::from(vec![0u8; 16]))
            .unwrap();

        let (status, headers, body) = send(&test.app, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["kind"], "unauthorized");
        assert_eq!(body["error"]["token_expired"], false);
        assert_eq!(body["error"]["authenticated"], false);
        // First contact still opens a browser session
        assert!(cookie_value(&headers).unwrap().starts_with("session_key="));

        let events = test.state.event_log().recent(10).await.unwrap();
        assert!(events.iter().any(|e| e.category == "Authentication"));
    }

    #[tokio::test]
    async fn test_expired_access_token_reports_token_expired() {
        let mut config = Config::default();
        config.auth.access_token_ttl_secs = -1;
        let test = test_app_with(config).await;
        let (access, _, _) = activated_agent(&test, "agent").await;

        let (status, _, body) = send(
            &test.app,
            json_request(
                "POST",
                "/upload",
                Some(&access),
                json!({ "path": "a.bin", "size": 10 }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["token_expired"], true);
        assert_eq!(body["error"]["authenticated"], false);
    }

    #[tokio::test]
    async fn test_stale_refresh_token_is_invalid_token() {
        let test = test_app().await;
        let (_, refresh, user_id) = activated_agent(&test, "agent").await;

        let first = json!({ "user_id": user_id, "refresh_token": refresh });
        let (status, _, body) =
            send(&test.app, json_request("POST", "/token/refresh", None, first.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body["refresh_token"], refresh.as_str());
        assert!(body["token_expiry"].as_i64().is_some());

        let (status, _, body) =
            send(&test.app, json_request("POST", "/token/refresh", None, first)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_token");

        let garbage = json!({ "user_id": "not-a-uuid", "refresh_token": "x" });
        let (status, _, body) =
            send(&test.app, json_request("POST", "/token/refresh", None, garbage)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_token");
    }

    #[tokio::test]
    async fn test_unsupported_method_is_json_405() {
        let test = test_app().await;
        let uri = format!("/upload/{}", uuid::Uuid::new_v4());

        let (status, _, body) = send(&test.app, empty_request("PATCH", &uri, None)).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["error"]["kind"], "method_not_allowed");

        let (status, _, body) = send(&test.app, empty_request("GET", "/token/refresh", None)).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["error"]["kind"], "method_not_allowed");

        let (status, _, body) = send(&test.app, empty_request("GET", "/nowhere", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_multipart_upload_end_to_end() {
        let test = test_app().await;
        let (access, _, _) = activated_agent(&test, "agent").await;

        let (status, _, body) = send(
            &test.app,
            json_request(
                "POST",
                "/upload",
                Some(&access),
                json!({ "path": "backup/db.tar", "size": 3_000_000, "backend": "local", "parts": 3 }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let upload_id = body["upload_id"].as_str().unwrap().to_string();

        // Out of order on purpose
        for part in [2u32, 1, 3] {
            let data = vec![part as u8; 1_000_000];
            let (status, _, body) =
                send(&test.app, part_request(&upload_id, part, &access, data.clone())).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["part_id"], part);
            assert_eq!(body["size"], 1_000_000);
            assert_eq!(body["checksum"], crate::storage::compute_checksum(&data));
        }

        let (status, _, body) = send(
            &test.app,
            empty_request("GET", &format!("/upload/{}", upload_id), Some(&access)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received_bytes"], 3_000_000);
        assert_eq!(body["received_parts"], json!([1, 2, 3]));

        let complete_uri = format!("/upload/{}/complete", upload_id);
        let (status, _, body) =
            send(&test.app, empty_request("POST", &complete_uri, Some(&access))).await;
        assert_eq!(status, StatusCode::OK);
        let location = body["location"].as_str().unwrap().to_string();
        assert_eq!(std::fs::metadata(&location).unwrap().len(), 3_000_000);

        let (status, _, body) =
            send(&test.app, empty_request("POST", &complete_uri, Some(&access))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "conflict");

        let (status, _, body) = send(
            &test.app,
            empty_request("DELETE", &format!("/upload/{}", upload_id), Some(&access)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
    }

    #[tokio::test]
    async fn test_incomplete_upload_and_bad_part_header() {
        let test = test_app().await;
        let (access, _, _) = activated_agent(&test, "agent").await;

        let (_, _, body) = send(
            &test.app,
            json_request(
                "POST",
                "/upload",
                Some(&access),
                json!({ "path": "x.bin", "size": 20, "parts": 2 }),
            ),
        )
        .await;
        let upload_id = body["upload_id"].as_str().unwrap().to_string();

        let (status, _, _) =
            send(&test.app, part_request(&upload_id, 1, &access, vec![1u8; 10])).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(
            &test.app,
            empty_request("POST", &format!("/upload/{}/complete", upload_id), Some(&access)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "incomplete_upload");
        assert_eq!(body["error"]["missing_parts"], json!([2]));

        let no_header = Request::builder()
            .method("PUT")
            .uri(format!("/upload/{}", upload_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .body(Body::from(vec![2u8; 10]))
            .unwrap();
        let (status, _, body) = send(&test.app, no_header).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_foreign_upload_is_not_found() {
        let test = test_app().await;
        let (alice, _, _) = activated_agent(&test, "alice").await;
        let (bob, _, _) = activated_agent(&test, "bob").await;

        let (_, _, body) = send(
            &test.app,
            json_request("POST", "/upload", Some(&alice), json!({ "path": "a", "size": 4 })),
        )
        .await;
        let upload_id = body["upload_id"].as_str().unwrap().to_string();

        let (status, _, body) =
            send(&test.app, part_request(&upload_id, 1, &bob, vec![1u8; 4])).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_single_shot_file_upload() {
        let test = test_app().await;
        let (access, _, _) = activated_agent(&test, "agent").await;

        let mut body = Vec::new();
        body.extend_from_slice(b"--b0undary\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"metadata\"\r\n\r\n");
        body.extend_from_slice(br#"{"path":"docs/notes.txt"}"#);
        body.extend_from_slice(b"\r\n--b0undary\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"fileContent\"; filename=\"notes.txt\"\r\n\r\n",
        );
        body.extend_from_slice(b"line one\r\nline two");
        body.extend_from_slice(b"\r\n--b0undary--\r\n");

        let request = Request::builder()
            .method("POST")
            .uri("/file")
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=b0undary")
            .body(Body::from(body))
            .unwrap();

        let (status, _, body) = send(&test.app, request).await;
        assert_eq!(status, StatusCode::OK);
        let location = body["location"].as_str().unwrap();
        assert_eq!(std::fs::read(location).unwrap(), b"line one\r\nline two");

        let missing = Request::builder()
            .method("POST")
            .uri("/file")
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=b0undary")
            .body(Body::from("--b0undary--\r\n"))
            .unwrap();
        let (status, _, body) = send(&test.app, missing).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], "Invalid input: File metadata is missing");
    }

    fn form_request(token: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/file")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "multipart/form-data; boundary=b0undary")
            .body(Body::from(body))
            .unwrap()
    }

    fn form_prefix(path: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(b"--b0undary\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"metadata\"\r\n\r\n");
        body.extend_from_slice(json!({ "path": path }).to_string().as_bytes());
        body.extend_from_slice(b"\r\n--b0undary\r\n");
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"fileContent\"; filename=\"blob\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body
    }

    #[tokio::test]
    async fn test_file_upload_keeps_binary_content_exact() {
        let test = test_app().await;
        let (access, _, _) = activated_agent(&test, "agent").await;

        // Every byte value, bare line breaks and a truncated delimiter
        let mut payload: Vec<u8> = (0..=255u8).collect();
        payload.extend_from_slice(b"\r\n--b0und\r\n\r\n--\n\r");
        payload.extend((0..=255u8).rev());

        let mut body = form_prefix("bin/blob.dat");
        body.extend_from_slice(&payload);
        body.extend_from_slice(b"\r\n--b0undary--\r\n");

        let (status, _, body) = send(&test.app, form_request(&access, body)).await;
        assert_eq!(status, StatusCode::OK);
        let location = body["location"].as_str().unwrap();
        assert_eq!(std::fs::read(location).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_file_upload_without_closing_boundary_is_rejected() {
        let test = test_app().await;
        let (access, _, _) = activated_agent(&test, "agent").await;

        let mut body = form_prefix("cut/off.bin");
        body.extend_from_slice(b"the stream stops here");

        let (status, _, body) = send(&test.app, form_request(&access, body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_input");

        let missing_type = Request::builder()
            .method("POST")
            .uri("/file")
            .header(header::AUTHORIZATION, format!("Bearer {}", access))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _, body) = send(&test.app, missing_type).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_input");
    }

    #[tokio::test]
    async fn test_heartbeat_and_settings() {
        let test = test_app().await;
        let (access, _, _) = activated_agent(&test, "agent").await;
        test.state
            .settings()
            .set_default("backup_interval", "3600", "int")
            .await
            .unwrap();

        let report = json!({
            "host_name": "build-01",
            "os": "linux",
            "client_version": "2.4.0",
            "domain": "corp"
        });
        let (status, _, body) =
            send(&test.app, json_request("POST", "/heartbeat", Some(&access), report)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["machine_id"].as_i64().is_some());
        assert!(body.get("first_check_in").is_none());

        let events = test.state.event_log().recent(10).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.category == "Heartbeat" && e.message.contains("build-01")));

        let (status, _, body) = send(
            &test.app,
            json_request("POST", "/heartbeat", Some(&access), json!({ "host_name": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_input");

        let (status, _, body) = send(&test.app, empty_request("GET", "/settings", Some(&access))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["backup_interval"]["value"], 3600);
        assert_eq!(body["settings"]["backup_interval"]["type"], "int");
        assert_eq!(body["settings"]["backup_interval"]["user_override"], false);
    }

    #[tokio::test]
    async fn test_browser_login_and_logout() {
        let test = test_app().await;
        activated_agent(&test, "carol").await;

        let (status, headers, _) = send(&test.app, empty_request("GET", "/settings", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let cookie = cookie_value(&headers).unwrap();

        let login = Request::builder()
            .method("POST")
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::COOKIE, &cookie)
            .body(Body::from(
                json!({ "user_name": "carol", "password": "secret-pw" }).to_string(),
            ))
            .unwrap();
        let (status, headers, _) = send(&test.app, login).await;
        assert_eq!(status, StatusCode::OK);
        let session = cookie_value(&headers).unwrap();
        assert_ne!(session, cookie);

        let with_cookie = |method: &str, uri: &str, cookie: &str| {
            Request::builder()
                .method(method)
                .uri(uri)
                .header(header::COOKIE, cookie)
                .body(Body::empty())
                .unwrap()
        };

        // The cookie held before login was retired
        let (status, _, _) = send(&test.app, with_cookie("GET", "/settings", &cookie)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = send(&test.app, with_cookie("GET", "/settings", &session)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, headers, _) = send(&test.app, with_cookie("POST", "/logout", &session)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(cookie_value(&headers).unwrap().ends_with('='));

        let (status, _, _) = send(&test.app, with_cookie("GET", "/settings", &session)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let bad_login = json_request(
            "POST",
            "/login",
            None,
            json!({ "user_name": "carol", "password": "wrong" }),
        );
        let (status, _, body) = send(&test.app, bad_login).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["authenticated"], false);
    }
}
