//! HTTP surface: upload, store, delivery, deletion, the replication
//! upgrade, and metrics.
//!
//! Handlers validate input, run the storage layer, and map the error
//! taxonomy onto status codes. Upload and store are only routed on
//! nodes that accept mutations, and a pure child refuses DELETE with
//! 404.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use crate::auth::{self, Credentials};
use crate::error::Error;
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::schema;
use crate::session;
use crate::stash::{NewFile, Stash};
use crate::store::Store;
use crate::wire;

#[derive(Clone)]
pub struct AppState {
    pub stash: Stash,
    pub store: Arc<Store>,
    pub bus: EventBus,
    pub credentials: Arc<Credentials>,
    /// Front-facing base URL used to build delivery URLs.
    pub frontend: String,
    /// True on nodes that replicate from a parent without `--forceparent`;
    /// such nodes refuse deletions.
    pub child_mode: bool,
    pub metrics: Metrics,
    pub http: reqwest::Client,
}

/// Assemble the router. `accept_uploads` is false in pure child mode,
/// which leaves the mutation endpoints unrouted.
pub fn router(state: AppState, accept_uploads: bool) -> Router {
    let mut app = Router::new();
    if accept_uploads {
        app = app
            .route("/api/upload", post(upload_handler))
            .route("/api/store", get(store_handler));
    }
    app.route("/api/repl", get(repl_upgrade))
        .route("/metrics", get(metrics_handler))
        .route(
            "/{drawer}/{filename}",
            get(deliver_handler).delete(delete_handler),
        )
        .with_state(state)
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::Validation(_) => StatusCode::NOT_ACCEPTABLE,
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::Storage(_) | Error::Network(_) | Error::Codec(_) | Error::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status.is_server_error() {
        warn!("request failed: {err}");
    }
    (status, err.to_string()).into_response()
}

// ─── Upload ───

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub drawer: Option<String>,
    pub ext: Option<String>,
}

/// POST /api/upload — store every multipart part under a fresh random
/// filename, all in one batch, and answer the delivery URLs as a JSON
/// array.
pub async fn upload_handler(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if !state.credentials.verify(&headers) {
        return auth::challenge();
    }

    let drawer = match params.drawer.as_deref() {
        Some(drawer) if schema::valid_drawer_name(drawer) => drawer.to_string(),
        _ => return error_response(Error::validation("no valid drawer name provided")),
    };

    let mut files = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let content = match field.bytes().await {
                    Ok(bytes) => bytes.to_vec(),
                    Err(e) => {
                        return error_response(Error::validation(format!(
                            "reading multipart body failed: {e}"
                        )))
                    }
                };
                files.push(NewFile {
                    content,
                    content_type,
                    source: None,
                    ext: params.ext.clone(),
                });
            }
            Ok(None) => break,
            Err(e) => {
                return error_response(Error::validation(format!(
                    "parsing multipart form failed: {e}"
                )))
            }
        }
    }

    match state.stash.upload(&drawer, files).await {
        Ok(filenames) => {
            state.metrics.uploads_total.inc();
            let urls: Vec<String> = filenames
                .iter()
                .map(|name| format!("{}/{drawer}/{name}", state.frontend))
                .collect();
            Json(urls).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ─── Store ───

#[derive(Debug, Deserialize)]
pub struct StoreParams {
    pub url: Option<String>,
    pub drawer: Option<String>,
    pub ext: Option<String>,
}

/// GET /api/store — fetch a remote URL and store its content, content
/// type and origin. Answers the delivery URL as plain text.
pub async fn store_handler(
    State(state): State<AppState>,
    Query(params): Query<StoreParams>,
    headers: HeaderMap,
) -> Response {
    if !state.credentials.verify(&headers) {
        return auth::challenge();
    }

    let Some(uri) = params.url.filter(|u| !u.is_empty()) else {
        return error_response(Error::validation("empty url parameter"));
    };
    let parsed = match url::Url::parse(&uri) {
        Ok(parsed) => parsed,
        Err(e) => return error_response(Error::validation(format!("invalid URL: {e}"))),
    };
    let drawer = match params.drawer.as_deref() {
        Some(drawer) if schema::valid_drawer_name(drawer) => drawer.to_string(),
        _ => return error_response(Error::validation("invalid drawer name")),
    };

    let response = match state.http.get(uri.clone()).send().await {
        Ok(response) => response,
        Err(e) => return error_response(Error::Network(format!("fetching URL failed: {e}"))),
    };
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let content = match response.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => return error_response(Error::Network(format!("reading HTTP body failed: {e}"))),
    };

    // Fall back to the fetched URL's extension when none was given.
    let ext = params.ext.or_else(|| {
        parsed
            .path()
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
    });

    let file = NewFile {
        content,
        content_type,
        source: Some(uri),
        ext,
    };
    match state.stash.upload(&drawer, vec![file]).await {
        Ok(filenames) => {
            state.metrics.uploads_total.inc();
            format!("{}/{drawer}/{}", state.frontend, filenames[0]).into_response()
        }
        Err(e) => error_response(e),
    }
}

// ─── Delivery ───

/// GET /{drawer}/{filename} — serve the blob with its recorded content
/// type, and the origin URL as `Content-Location` when one is stored.
pub async fn deliver_handler(
    State(state): State<AppState>,
    Path((drawer, filename)): Path<(String, String)>,
) -> Response {
    let store = state.store.clone();
    let lookup = tokio::task::spawn_blocking(move || {
        let content = store.get(&schema::file_key(&drawer, &filename))?;
        let metadata = store.get(&schema::meta_key(&drawer, &filename))?;
        Ok::<_, Error>((content, metadata))
    })
    .await;

    let (content, metadata) = match lookup {
        Ok(Ok((Some(content), metadata))) => (content, metadata),
        Ok(Ok((None, _))) => return error_response(Error::NotFound),
        Ok(Err(e)) => return error_response(e),
        Err(e) => return error_response(Error::Internal(e.to_string())),
    };

    // A missing metadata record degrades to an opaque content type.
    let metadata = match metadata {
        Some(bytes) => match wire::decode_metadata(&bytes) {
            Ok(metadata) => metadata,
            Err(e) => return error_response(e),
        },
        None => wire::MetaData {
            content_type: "application/octet-stream".to_string(),
            source: None,
        },
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_str(&metadata.content_type)
            .unwrap_or_else(|_| header::HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(source) = &metadata.source {
        if let Ok(value) = header::HeaderValue::from_str(source) {
            headers.insert(header::CONTENT_LOCATION, value);
        }
    }

    state.metrics.deliveries_total.inc();
    (StatusCode::OK, headers, content).into_response()
}

// ─── Deletion ───

/// DELETE /{drawer}/{filename} — remove the file and log the event.
/// Pure children refuse with 404, like every other mutation.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path((drawer, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if state.child_mode {
        return error_response(Error::NotFound);
    }
    if !state.credentials.verify(&headers) {
        return auth::challenge();
    }

    match state.stash.delete(&drawer, &filename).await {
        Ok(()) => {
            state.metrics.deletions_total.inc();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(e),
    }
}

// ─── Replication ───

/// GET /api/repl — upgrade to the replication wire and run a session.
pub async fn repl_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !state.credentials.verify(&headers) {
        return auth::challenge();
    }
    let store = state.store.clone();
    let bus = state.bus.clone();
    ws.on_upgrade(move |socket| session::run(socket, store, bus))
        .into_response()
}

// ─── Metrics ───

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.metrics.encode().into_response()
}
