// SPDX-License-Identifier: Apache-2.0

//! The HTTP front door: embedded static assets, the site-listing API,
//! prefix validation, and lazy construction of per-prefix site servers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use extempore_core::{normalize_prefix, SiteError, CONTENT_TYPE_HTML, MAX_PREFIX_LEN};
use extempore_genai::ModelClient;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use tracing::info;

use crate::file::SiteDir;
use crate::progress_writer::{DefaultProgressWriter, ProgressWriter};
use crate::prompter::Prompter;
use crate::server::SiteServer;
use crate::site::{Payload, ServeFn, Site};
use crate::transform::{default_transformer, SOCIAL_CARD_SLUG};
use crate::worker_pool::WorkerPool;

const INDEX_HTML: &[u8] = include_bytes!("../assets/index.html");
const NOTFOUND_HTML: &[u8] = include_bytes!("../assets/notfound.html");
const BANNER_HTML: &[u8] = include_bytes!("../assets/banner.html");
const SAFETY_HTML: &[u8] = include_bytes!("../assets/safety.html");
const FAVICON_ICO: &[u8] = include_bytes!("../assets/favicon.ico");
const ROBOTS_TXT: &[u8] = include_bytes!("../assets/robots.txt");

const CACHE_CONTROL_LANDING: &str = "public, max-age=10";
const CACHE_CONTROL_STATIC: &str = "public, max-age=3600";

/// Shared application state: one gateway per process.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    content_root: PathBuf,
    base_url: String,
    model: Arc<dyn ModelClient>,
    pool: Arc<WorkerPool>,
    progress_writer: Arc<dyn ProgressWriter>,
    servers: Mutex<HashMap<String, Arc<SiteServer>>>,
}

impl Gateway {
    #[must_use]
    pub fn new(
        content_root: PathBuf,
        base_url: String,
        model: Arc<dyn ModelClient>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                content_root,
                base_url,
                model,
                pool,
                progress_writer: Arc::new(DefaultProgressWriter),
                servers: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(landing))
            .route("/index.html", get(landing))
            .route("/banner.html", get(banner))
            .route("/favicon.ico", get(favicon))
            .route("/robots.txt", get(robots))
            .route("/api/sites", get(list_sites))
            .fallback(get(dispatch_site))
            .with_state(self)
    }

    /// Find or lazily build the server for a validated prefix, creating its
    /// content subdirectory on first use. The lock covers map access only;
    /// construction (directory creation included) runs unlocked, and a
    /// racing builder defers to whoever inserted first.
    fn server_for(&self, prefix: &str) -> Result<Arc<SiteServer>, SiteError> {
        if let Some(server) = self.inner.servers.lock().get(prefix) {
            return Ok(Arc::clone(server));
        }

        let dir = SiteDir::create(self.inner.content_root.join(prefix))?;
        let prompter = Prompter::new(Arc::clone(&self.inner.model), prefix, dir.clone());
        let transformer = default_transformer(prefix, &self.inner.base_url);
        let site = Site::new(
            Arc::clone(&self.inner.model),
            prompter,
            dir,
            Some(transformer),
        );
        let built = Arc::new(SiteServer::new(
            Arc::new(site),
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.progress_writer),
            unsafe_serve(&self.inner.content_root),
        ));

        let mut servers = self.inner.servers.lock();
        let server = servers
            .entry(prefix.to_string())
            .or_insert_with(|| Arc::clone(&built));
        let server = Arc::clone(server);
        drop(servers);

        if Arc::ptr_eq(&server, &built) {
            info!(prefix = %prefix, "site created");
        }
        Ok(server)
    }
}

/// The unsafe handler serves the embedded safety page (overridable from the
/// content root, like every static asset).
fn unsafe_serve(content_root: &Path) -> ServeFn {
    let body = static_bytes(content_root, "safety.html", SAFETY_HTML);
    Arc::new(move || {
        let body = body.clone();
        Box::pin(async move {
            Ok(Payload {
                status: StatusCode::OK,
                content_type: CONTENT_TYPE_HTML,
                cache_control: Some(CACHE_CONTROL_STATIC),
                body,
            })
        })
    })
}

/// An embedded asset, unless the content root carries an override with the
/// same name.
fn static_bytes(content_root: &Path, name: &str, embedded: &'static [u8]) -> Bytes {
    match std::fs::read(content_root.join(name)) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => Bytes::from_static(embedded),
    }
}

fn static_response(
    gateway: &Gateway,
    name: &str,
    embedded: &'static [u8],
    content_type: &'static str,
    cache_control: &'static str,
) -> Response {
    Payload {
        status: StatusCode::OK,
        content_type,
        cache_control: Some(cache_control),
        body: static_bytes(&gateway.inner.content_root, name, embedded),
    }
    .into_response()
}

async fn landing(State(gateway): State<Gateway>) -> Response {
    static_response(
        &gateway,
        "index.html",
        INDEX_HTML,
        CONTENT_TYPE_HTML,
        CACHE_CONTROL_LANDING,
    )
}

async fn banner(State(gateway): State<Gateway>) -> Response {
    static_response(
        &gateway,
        "banner.html",
        BANNER_HTML,
        CONTENT_TYPE_HTML,
        CACHE_CONTROL_STATIC,
    )
}

async fn favicon(State(gateway): State<Gateway>) -> Response {
    static_response(
        &gateway,
        "favicon.ico",
        FAVICON_ICO,
        "image/x-icon",
        CACHE_CONTROL_STATIC,
    )
}

async fn robots(State(gateway): State<Gateway>) -> Response {
    static_response(&gateway, "robots.txt", ROBOTS_TXT, "text/plain", CACHE_CONTROL_STATIC)
}

fn not_found_page(gateway: &Gateway) -> Response {
    static_response(
        gateway,
        "notfound.html",
        NOTFOUND_HTML,
        CONTENT_TYPE_HTML,
        CACHE_CONTROL_STATIC,
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SiteEntry {
    slug: String,
    image_path: String,
    #[serde(skip)]
    created: SystemTime,
}

/// Discovery API: every site directory with a materialized social card,
/// newest first.
async fn list_sites(State(gateway): State<Gateway>) -> Response {
    let entries = match std::fs::read_dir(&gateway.inner.content_root) {
        Ok(entries) => entries,
        Err(err) => {
            return Payload::internal_error(format!("failed to read content directory: {err}"))
                .into_response()
        }
    };

    let mut sites = Vec::new();
    for entry in entries.flatten() {
        if !entry.path().is_dir() {
            continue;
        }
        let Ok(slug) = entry.file_name().into_string() else {
            continue;
        };
        let card = entry.path().join(SOCIAL_CARD_SLUG);
        let Ok(meta) = std::fs::metadata(&card) else {
            continue;
        };
        sites.push(SiteEntry {
            image_path: format!("/{slug}/{SOCIAL_CARD_SLUG}"),
            slug,
            created: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    sites.sort_by(|a, b| b.created.cmp(&a.created));

    let mut response = Json(sites).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_LANDING),
    );
    response
}

/// Everything that is not a fixed route: validate the prefix, redirect bare
/// prefixes to their canonical trailing-slash form, and hand the in-site
/// path to the per-prefix server.
async fn dispatch_site(State(gateway): State<Gateway>, uri: Uri) -> Response {
    let decoded = percent_decode_str(uri.path()).decode_utf8_lossy().to_string();
    let path = decoded.trim_start_matches('/');

    let (raw_prefix, rest) = match path.split_once('/') {
        Some((prefix, rest)) => (prefix, Some(rest)),
        None => (path, None),
    };

    let prefix = normalize_prefix(raw_prefix);
    if prefix.is_empty() || prefix != raw_prefix || prefix.len() > MAX_PREFIX_LEN {
        return not_found_page(&gateway);
    }

    let Some(rest) = rest else {
        return redirect_to_slash(&prefix);
    };

    let server = match gateway.server_for(&prefix) {
        Ok(server) => server,
        Err(err) => {
            return Payload::internal_error(format!(
                "failed to create server for prefix {prefix}: {err}"
            ))
            .into_response()
        }
    };

    server.respond(rest).await
}

fn redirect_to_slash(prefix: &str) -> Response {
    let location = format!("/{prefix}/");
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}
