//! HTTP routes.
//!
//! | Path | Description |
//! |------|-------------|
//! | `GET /stream` | The live broadcast (chunked, ends only when the engine stops; 503 after that) |
//! | `GET /files` | Playable files in the sounds directory |
//! | `POST /upload` | Multipart upload, field `file` |
//! | `POST /play/{file}` | Switch the broadcast to a stored file |
//! | `POST /stop` | Switch the broadcast back to silence |
//! | `GET /status` | Engine state and metrics |
//! | `GET /health` | Liveness probe |
//!
//! Anything else is served from the public directory.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use soundtag_engine::{EngineHandle, ListenerGuard};
use soundtag_ipc::{EngineState, SourceSpec, SwitchError};

use crate::error::ApiError;
use crate::library::{sanitize_file_name, SoundLibrary};

/// Shared state passed to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub library: Arc<SoundLibrary>,
    pub content_type: &'static str,
}

/// Build the application router.
pub fn build_router(state: AppState, public_dir: &Path, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/files", get(list_files))
        .route("/upload", post(upload))
        .route("/play/{file}", post(play))
        .route("/stop", post(stop))
        .route("/status", get(status))
        .route("/health", get(health))
        .fallback_service(ServeDir::new(public_dir))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Listener body: chunks until the engine drops the sink or the client goes away.
struct ListenerStream {
    chunks: ReceiverStream<Bytes>,
    guard: ListenerGuard,
}

impl Stream for ListenerStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx).map(|chunk| chunk.map(Ok))
    }
}

impl Drop for ListenerStream {
    fn drop(&mut self) {
        info!(listener = %self.guard.id(), "Listener disconnected");
    }
}

async fn stream(State(state): State<AppState>) -> Result<Response, ApiError> {
    let listener = state
        .engine
        .attach_listener()
        .ok_or(ApiError::Switch(SwitchError::EngineUnavailable))?;
    let (rx, guard) = listener.into_parts();
    info!(
        listener = %guard.id(),
        listeners = state.engine.registry().len(),
        "Listener connected"
    );

    let body = Body::from_stream(ListenerStream {
        chunks: ReceiverStream::new(rx),
        guard,
    });

    Ok((
        [
            (header::CONTENT_TYPE, state.content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    let files = state
        .library
        .list()
        .await
        .map_err(ApiError::storage("Failed to read sounds directory"))?;
    Ok(Json(files))
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original = field.file_name().unwrap_or_default().to_string();
        let name = sanitize_file_name(&original)
            .ok_or_else(|| ApiError::BadRequest(format!("Invalid file name {original:?}")))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;

        state
            .library
            .store(&name, &data)
            .await
            .map_err(ApiError::storage("Failed to save file"))?;

        info!(file = %name, bytes = data.len(), "Upload stored");
        return Ok(Json(json!({ "success": true, "file": name })));
    }

    Err(ApiError::BadRequest("No file uploaded".to_string()))
}

async fn play(
    State(state): State<AppState>,
    UrlPath(file): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let path = state
        .library
        .resolve(&file)
        .await
        .ok_or(ApiError::NotFound("File not found"))?;

    let current = switch(&state.engine, SourceSpec::File(path)).await?;
    Ok(Json(json!({ "success": true, "state": current })))
}

async fn stop(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let current = switch(&state.engine, SourceSpec::Silence).await?;
    Ok(Json(json!({ "success": true, "state": current })))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "state": state.engine.state(),
        "metrics": state.engine.metrics(),
    }))
}

async fn health() -> &'static str {
    "OK"
}

/// `switch_to` blocks until the engine answers, so it runs off the async workers.
async fn switch(engine: &EngineHandle, spec: SourceSpec) -> Result<EngineState, ApiError> {
    debug!(source = %spec, "Switch requested over HTTP");
    let engine = engine.clone();
    let result = tokio::task::spawn_blocking(move || engine.switch_to(spec))
        .await
        .map_err(|e| ApiError::Internal(format!("Switch task failed: {e}")))?;
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use soundtag_engine::{create_engine, Engine, EngineConfig};
    use soundtag_transcoder::{SourceCommand, TranscoderConfig};

    /// `sh` stand-in for ffmpeg: silence prints `s` every 20 ms, files are cat'ed slowly.
    struct ShellCommand;

    impl SourceCommand for ShellCommand {
        fn build(&self, spec: &SourceSpec) -> std::process::Command {
            let mut cmd = std::process::Command::new("sh");
            match spec {
                SourceSpec::Silence => {
                    cmd.arg("-c").arg("while :; do printf s; sleep 0.02; done");
                }
                SourceSpec::File(path) => {
                    cmd.arg("-c")
                        .arg("while :; do cat \"$1\" || exit 1; sleep 0.02; done")
                        .arg("sh")
                        .arg(path);
                }
            }
            cmd
        }

        fn name(&self) -> &'static str {
            "sh"
        }
    }

    struct TestApp {
        router: Router,
        engine: EngineHandle,
        library: Arc<SoundLibrary>,
        _idle: Option<Engine>,
        _dir: tempfile::TempDir,
    }

    impl Drop for TestApp {
        fn drop(&mut self) {
            self.engine.shutdown();
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            transcoder: TranscoderConfig {
                startup_probe: std::time::Duration::from_millis(300),
                ..TranscoderConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    /// Router over an engine; `running` spawns the engine thread.
    async fn setup(running: bool) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(SoundLibrary::new(dir.path().join("sounds")));
        library.ensure().await.unwrap();

        let (event_tx, _event_rx) = soundtag_ipc::event_channel();
        let (engine, handle) = create_engine(config(), Arc::new(ShellCommand), event_tx);
        let idle = if running {
            engine.spawn().unwrap();
            None
        } else {
            Some(engine)
        };

        let state = AppState {
            engine: handle.clone(),
            library: Arc::clone(&library),
            content_type: "audio/mpeg",
        };
        let router = build_router(state, &dir.path().join("public"), 1024 * 1024);

        TestApp {
            router,
            engine: handle,
            library,
            _idle: idle,
            _dir: dir,
        }
    }

    async fn json_body(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = setup(false).await;
        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_list_files() {
        let app = setup(false).await;
        for name in ["b.mp3", "a.wav", "notes.txt"] {
            std::fs::write(app.library.dir().join(name), b"x").unwrap();
        }

        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!(["a.wav", "b.mp3"]));
    }

    #[tokio::test]
    async fn test_list_files_unreadable_dir() {
        let app = setup(false).await;
        std::fs::remove_dir(app.library.dir()).unwrap();

        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/files").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            json_body(response).await,
            json!({ "error": "Failed to read sounds directory" })
        );
    }

    #[tokio::test]
    async fn test_play_missing_file_is_not_found() {
        let app = setup(false).await;

        for uri in ["/play/missing.mp3", "/play/..%2Fsecret.mp3"] {
            let response = app.router.clone().oneshot(post(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert_eq!(json_body(response).await, json!({ "error": "File not found" }));
        }
    }

    #[tokio::test]
    async fn test_upload_sanitises_name() {
        let app = setup(false).await;
        let body = "--XBOUNDARY\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"my song!.mp3\"\r\n\
            Content-Type: audio/mpeg\r\n\r\n\
            ID3DATA\r\n\
            --XBOUNDARY--\r\n";

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "success": true, "file": "my_song_.mp3" })
        );
        assert_eq!(
            std::fs::read(app.library.dir().join("my_song_.mp3")).unwrap(),
            b"ID3DATA"
        );
    }

    #[tokio::test]
    async fn test_upload_without_file_is_bad_request() {
        let app = setup(false).await;
        let body = "--XBOUNDARY\r\n\
            Content-Disposition: form-data; name=\"other\"\r\n\r\n\
            value\r\n\
            --XBOUNDARY--\r\n";

        let response = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload")
                    .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await, json!({ "error": "No file uploaded" }));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_play_then_stop() {
        let app = setup(true).await;
        std::fs::write(app.library.dir().join("a.mp3"), b"f").unwrap();

        let response = app.router.clone().oneshot(post("/play/a.mp3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["state"]["state"], json!("playing_file"));

        let response = app.router.clone().oneshot(post("/stop")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["state"]["state"], json!("silence"));

        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["state"]["state"], json!("silence"));
        assert_eq!(body["metrics"]["switches"], json!(3));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_delivers_broadcast() {
        use tokio_stream::StreamExt;

        let app = setup(true).await;
        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
        assert_eq!(app.engine.registry().len(), 1);

        let mut body = response.into_body().into_data_stream();
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(chunk.iter().all(|&b| b == b's'));

        drop(body);
        assert!(app.engine.registry().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_unavailable_after_engine_shutdown() {
        let app = setup(true).await;
        app.engine.shutdown();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !app.engine.registry().is_closed() {
            assert!(tokio::time::Instant::now() < deadline, "engine never shut down");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let response = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/stream").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await, json!({ "error": "Engine unavailable" }));
        assert!(app.engine.registry().is_empty());
    }
}
