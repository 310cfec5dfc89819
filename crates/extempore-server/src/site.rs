// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use extempore_core::{
    content_type_for_slug, extension_for_slug, sanitize_url, SiteError, SiteErrorCode,
    EXTENSION_HTML, EXTENSION_JPG, INDEX_SLUG, NOT_FOUND_SLUG,
};
use extempore_genai::{ModelClient, ProgressFn};
use extempore_sanitize::{parse_html, render_html, rewrite_urls, Handle, SanitizeError};
use parking_lot::Mutex;
use tracing::debug;

use crate::file::{append_contents, write_file_atomic, SiteDir};
use crate::prompter::Prompter;

pub(crate) const LINKS_TXT: &str = "links.txt";

pub const CACHE_CONTROL_IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// A fully materialized response: what a serve function produces and what
/// the progress writer inspects before deciding how to finish a stream.
#[derive(Debug, Clone)]
pub struct Payload {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub cache_control: Option<&'static str>,
    pub body: Bytes,
}

impl Payload {
    #[must_use]
    pub fn ok(content_type: &'static str, cache_control: &'static str, body: Bytes) -> Self {
        Self {
            status: StatusCode::OK,
            content_type,
            cache_control: Some(cache_control),
            body,
        }
    }

    /// The early-headers stub sent for a miss when progress streaming is not
    /// in use.
    #[must_use]
    pub fn accepted(content_type: &'static str) -> Self {
        Self {
            status: StatusCode::ACCEPTED,
            content_type,
            cache_control: None,
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        let mut body = message.into();
        body.push('\n');
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            content_type: "text/plain; charset=utf-8",
            cache_control: None,
            body: Bytes::from(body),
        }
    }
}

impl IntoResponse for Payload {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.content_type),
        );
        if let Some(cache_control) = self.cache_control {
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
        }
        response
    }
}

pub type ServeFuture = Pin<Box<dyn Future<Output = Result<Payload, SiteError>> + Send>>;

/// A ready-to-run response producer. Cheap to clone and runnable once per
/// waiter.
pub type ServeFn = Arc<dyn Fn() -> ServeFuture + Send + Sync>;

pub type GenerateFuture = Pin<Box<dyn Future<Output = ServeFn> + Send>>;

/// The deferred half of a cache miss: invoked on a pool worker with the
/// progress sink, resolves to the final serve function.
pub type GenerateFn = Box<dyn FnOnce(ProgressFn) -> GenerateFuture + Send>;

/// Document transformer applied after sanitization, before rendering. Extra
/// URLs it needs resolved go into the set and become generated slugs.
pub type HtmlTransformFn =
    Arc<dyn Fn(&Handle, &mut BTreeSet<String>) -> Result<(), SiteError> + Send + Sync>;

pub(crate) fn serve_payload(payload: Payload) -> ServeFn {
    Arc::new(move || {
        let payload = payload.clone();
        Box::pin(async move { Ok(payload) })
    })
}

pub(crate) fn serve_error(err: SiteError) -> ServeFn {
    Arc::new(move || {
        let err = err.clone();
        Box::pin(async move { Err(err) })
    })
}

struct Resource {
    size: AtomicU64,
    gate: tokio::sync::Mutex<()>,
}

impl Resource {
    fn new(size: u64) -> Self {
        Self {
            size: AtomicU64::new(size),
            gate: tokio::sync::Mutex::new(()),
        }
    }
}

#[derive(Default)]
struct SiteState {
    /// Lazily populated from the links journal plus the reserved slugs.
    resources: Option<HashMap<String, Arc<Resource>>>,
    /// Newline-joined list of known slugs, interpolated into HTML prompts.
    links: String,
    marked_unsafe: bool,
}

/// The seam the per-site HTTP dispatcher talks through. `Site` is the real
/// implementation; tests substitute their own.
pub trait SiteHandler: Send + Sync {
    /// Resolve a slug: a ready serve function on a hit, a stub plus a
    /// generator on a miss, `NotFound` for unknown slugs, and `Unsafe` once
    /// the site is marked.
    fn handle(&self, slug: &str) -> Result<(ServeFn, Option<GenerateFn>), SiteError>;
}

/// One per URL prefix: the cache index of known slugs and the generation
/// pipeline that fills them in.
pub struct Site {
    inner: Arc<SiteInner>,
}

struct SiteInner {
    model: Arc<dyn ModelClient>,
    prompter: Prompter,
    dir: SiteDir,
    transformer: Option<HtmlTransformFn>,
    state: Mutex<SiteState>,
}

impl Site {
    #[must_use]
    pub fn new(
        model: Arc<dyn ModelClient>,
        prompter: Prompter,
        dir: SiteDir,
        transformer: Option<HtmlTransformFn>,
    ) -> Self {
        Self {
            inner: Arc::new(SiteInner {
                model,
                prompter,
                dir,
                transformer,
                state: Mutex::new(SiteState::default()),
            }),
        }
    }

    pub fn handle(&self, slug: &str) -> Result<(ServeFn, Option<GenerateFn>), SiteError> {
        let resource = {
            let mut state = self.inner.state.lock();
            if state.marked_unsafe {
                return Err(SiteError::unsafe_site());
            }
            self.inner.resource_locked(&mut state, slug)?
        };

        if resource.size.load(Ordering::Acquire) > 0 {
            let serve = self
                .inner
                .serve_file(slug, resource.size.load(Ordering::Acquire))?;
            return Ok((serve, None));
        }

        let stub = serve_payload(Payload::accepted(content_type_for_slug(slug)?));
        let inner = Arc::clone(&self.inner);
        let slug = slug.to_string();
        let generate: GenerateFn = Box::new(move |progress| {
            Box::pin(async move { inner.generate_entry(slug, progress).await })
        });
        Ok((stub, Some(generate)))
    }
}

impl SiteHandler for Site {
    fn handle(&self, slug: &str) -> Result<(ServeFn, Option<GenerateFn>), SiteError> {
        Site::handle(self, slug)
    }
}

impl SiteInner {
    fn resource(&self, slug: &str) -> Result<Arc<Resource>, SiteError> {
        let mut state = self.state.lock();
        self.resource_locked(&mut state, slug)
    }

    fn resource_locked(
        &self,
        state: &mut SiteState,
        slug: &str,
    ) -> Result<Arc<Resource>, SiteError> {
        if state.resources.is_none() {
            self.init_resources(state)?;
        }
        state
            .resources
            .as_ref()
            .and_then(|resources| resources.get(slug))
            .cloned()
            .ok_or_else(|| SiteError::not_found(slug))
    }

    /// Seed the resource index with the reserved slugs and every line of the
    /// links journal, recording on-disk sizes. Duplicate and blank journal
    /// lines are tolerated.
    fn init_resources(&self, state: &mut SiteState) -> Result<(), SiteError> {
        let mut lines: Vec<String> = Vec::new();
        match std::fs::read_to_string(self.dir.path().join(LINKS_TXT)) {
            Ok(content) => lines.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(String::from),
            ),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(SiteError::io(format!("failed to read {LINKS_TXT}: {err}")));
            }
        }
        lines.push(INDEX_SLUG.to_string());
        lines.push(NOT_FOUND_SLUG.to_string());

        let mut resources = HashMap::with_capacity(lines.len());
        let mut links = String::new();
        for line in lines {
            if resources.contains_key(&line) {
                continue;
            }
            let size = self
                .dir
                .join(&line)
                .ok()
                .and_then(|path| std::fs::metadata(path).ok())
                .map_or(0, |meta| meta.len());
            resources.insert(line.clone(), Arc::new(Resource::new(size)));
            links.push_str(&line);
            links.push('\n');
        }

        state.resources = Some(resources);
        state.links = links;
        Ok(())
    }

    fn serve_file(&self, slug: &str, size: u64) -> Result<ServeFn, SiteError> {
        let content_type = content_type_for_slug(slug)?;
        let path = self.dir.join(slug)?;
        let slug = slug.to_string();
        Ok(Arc::new(move || {
            let path = path.clone();
            let slug = slug.clone();
            Box::pin(async move {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|err| SiteError::io(format!("failed to open file {slug}: {err}")))?;
                if bytes.len() as u64 != size {
                    return Err(SiteError::unexpected_size(format!(
                        "read {} bytes of {slug}, expected {size}",
                        bytes.len()
                    )));
                }
                Ok(Payload::ok(
                    content_type,
                    CACHE_CONTROL_IMMUTABLE,
                    Bytes::from(bytes),
                ))
            })
        }))
    }

    /// The generator body run on a pool worker. Errors are folded into the
    /// serve function so every waiter sees the same outcome.
    async fn generate_entry(self: Arc<Self>, slug: String, progress: ProgressFn) -> ServeFn {
        let resource = match self.resource(&slug) {
            Ok(resource) => resource,
            Err(err) => {
                return serve_payload(Payload::internal_error(format!(
                    "failed to index resources for {slug}: {err}"
                )))
            }
        };

        let _gate = resource.gate.lock().await;

        // Another worker may have filled this slug while we queued.
        let size = resource.size.load(Ordering::Acquire);
        if size > 0 {
            return match self.serve_file(&slug, size) {
                Ok(serve) => serve,
                Err(err) => serve_payload(Payload::internal_error(err.to_string())),
            };
        }

        let bytes = match self.generate(&slug, &progress).await {
            Ok(bytes) => bytes,
            Err(err) if err.is(SiteErrorCode::Unsafe) => {
                self.state.lock().marked_unsafe = true;
                return serve_error(err);
            }
            Err(err) => {
                return serve_payload(Payload::internal_error(format!(
                    "failed to generate {slug}: {err}"
                )))
            }
        };

        if let Err(err) = write_file_atomic(&self.dir, &slug, &bytes) {
            return serve_payload(Payload::internal_error(format!(
                "failed to write generated file {slug} ({} bytes): {err}",
                bytes.len()
            )));
        }
        resource.size.store(bytes.len() as u64, Ordering::Release);
        debug!(slug = %slug, bytes = bytes.len(), "generated");

        let content_type = match content_type_for_slug(&slug) {
            Ok(content_type) => content_type,
            Err(err) => return serve_payload(Payload::internal_error(err.to_string())),
        };
        serve_payload(Payload::ok(
            content_type,
            CACHE_CONTROL_IMMUTABLE,
            Bytes::from(bytes),
        ))
    }

    async fn generate(&self, slug: &str, progress: &ProgressFn) -> Result<Vec<u8>, SiteError> {
        progress(&format!("Generating {slug}...\n"));

        let links = self.state.lock().links.clone();
        let prompt = self.prompter.prompt_for_slug(slug, &links, progress).await?;

        let bytes = match extension_for_slug(slug)? {
            EXTENSION_HTML => self.generate_html(&prompt, progress).await?,
            EXTENSION_JPG => self.generate_jpg(&prompt, progress).await?,
            _ => return Err(SiteError::invalid_slug(slug)),
        };

        if bytes.is_empty() {
            return Err(SiteError::unexpected_size(format!("{slug}: empty output")));
        }
        Ok(bytes)
    }

    async fn generate_html(
        &self,
        prompt: &str,
        progress: &ProgressFn,
    ) -> Result<Vec<u8>, SiteError> {
        let raw = self
            .model
            .html(prompt, progress)
            .await
            .map_err(|err| SiteError::model(err.to_string()))?;

        let dom = parse_html(&raw);
        let mut urls = BTreeSet::new();
        rewrite_urls(&dom.document, &mut urls, &sanitize_url).map_err(from_sanitize)?;

        if let Some(transformer) = &self.transformer {
            transformer(&dom.document, &mut urls)?;
        }

        self.record_links(&urls)?;

        render_html(&dom.document).map_err(from_sanitize)
    }

    async fn generate_jpg(&self, prompt: &str, progress: &ProgressFn) -> Result<Vec<u8>, SiteError> {
        let mut raw = None;
        let mut last_err = String::new();
        for attempt in 0..3 {
            match self.model.png(prompt, progress).await {
                Ok(bytes) => {
                    raw = Some(bytes);
                    break;
                }
                Err(err) => {
                    last_err = err.to_string();
                    if attempt < 2 {
                        progress(&format!(
                            "image generation failed (attempt {}/3), retrying...\n",
                            attempt + 1
                        ));
                    }
                }
            }
        }
        let raw = raw.ok_or_else(|| {
            SiteError::model(format!("image generation failed after 3 attempts: {last_err}"))
        })?;

        let img = image::load_from_memory_with_format(&raw, image::ImageFormat::Png)
            .map_err(|err| SiteError::model(format!("failed to decode png: {err}")))?;
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Jpeg)
            .map_err(|err| SiteError::model(format!("failed to encode jpeg: {err}")))?;
        Ok(out.into_inner())
    }

    /// Register every newly seen URL as a known slug: into the resource
    /// index, the in-memory links snapshot, and the on-disk journal.
    fn record_links(&self, urls: &BTreeSet<String>) -> Result<(), SiteError> {
        let mut state = self.state.lock();
        let mut fresh = String::new();
        {
            let resources = state.resources.get_or_insert_with(HashMap::new);
            for url in urls {
                if resources.contains_key(url) {
                    continue;
                }
                resources.insert(url.clone(), Arc::new(Resource::new(0)));
                fresh.push_str(url);
                fresh.push('\n');
            }
        }
        if !fresh.is_empty() {
            state.links.push_str(&fresh);
            append_contents(&self.dir, LINKS_TXT, fresh.as_bytes())?;
        }
        Ok(())
    }
}

fn from_sanitize(err: SanitizeError) -> SiteError {
    match err {
        SanitizeError::MaxDepthExceeded => {
            SiteError::new(SiteErrorCode::MaxDepthExceeded, "document tree too deep")
        }
        SanitizeError::Render(message) => SiteError::sanitize(message),
        _ => unreachable!("SanitizeError is non_exhaustive; no other variants exist"),
    }
}

#[cfg(test)]
mod tests {
    use extempore_core::CONTENT_TYPE_HTML;

    use super::*;
    use crate::fake_model::FakeModel;

    fn noop_progress() -> ProgressFn {
        Arc::new(|_| {})
    }

    fn site_in(dir: &std::path::Path, model: Arc<FakeModel>) -> Site {
        let site_dir = SiteDir::open(dir).expect("open dir");
        let prompter = Prompter::new(
            Arc::clone(&model) as Arc<dyn ModelClient>,
            "goats",
            site_dir.clone(),
        );
        Site::new(model, prompter, site_dir, None)
    }

    async fn run_generate(site: &Site, slug: &str) -> Payload {
        let (_stub, generate) = site.handle(slug).expect("handle");
        let generate = generate.expect("expected a miss");
        let serve = generate(noop_progress()).await;
        serve().await.expect("serve")
    }

    #[tokio::test]
    async fn unknown_slugs_are_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let site = site_in(tmp.path(), Arc::new(FakeModel::new()));
        let err = match site.handle("nope.html") {
            Err(err) => err,
            Ok(_) => panic!("not found"),
        };
        assert!(err.is(SiteErrorCode::NotFound));
    }

    #[tokio::test]
    async fn miss_generates_persists_and_then_hits() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let model = Arc::new(FakeModel::new());
        let site = site_in(tmp.path(), Arc::clone(&model));

        let payload = run_generate(&site, INDEX_SLUG).await;
        assert_eq!(payload.status, StatusCode::OK);
        assert_eq!(payload.content_type, CONTENT_TYPE_HTML);
        assert_eq!(payload.cache_control, Some(CACHE_CONTROL_IMMUTABLE));
        assert!(!payload.body.is_empty());

        let on_disk = std::fs::read(tmp.path().join(INDEX_SLUG)).expect("artifact");
        assert_eq!(on_disk, payload.body.to_vec());

        // Now a hit: no second model call, same bytes, sized headers.
        let (serve, generate) = site.handle(INDEX_SLUG).expect("handle");
        assert!(generate.is_none());
        let hit = serve().await.expect("serve hit");
        assert_eq!(hit.status, StatusCode::OK);
        assert_eq!(hit.body, payload.body);
        assert_eq!(model.html_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discovered_urls_become_known_slugs_and_journal_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let model = Arc::new(FakeModel::new());
        *model.html_body.lock() = concat!(
            "<html><body>",
            "<a href=\"dog-facts.html\">dogs</a>",
            "<img src=\"hero photo.png\" width=\"10\" height=\"10\">",
            "</body></html>"
        )
        .to_string();
        let site = site_in(tmp.path(), Arc::clone(&model));

        let payload = run_generate(&site, INDEX_SLUG).await;
        let body = String::from_utf8(payload.body.to_vec()).expect("utf8");
        assert!(body.contains("href=\"dog-facts.html\""));
        assert!(body.contains("src=\"hero-photo.jpg\""));

        let journal = std::fs::read_to_string(tmp.path().join(LINKS_TXT)).expect("journal");
        assert!(journal.contains("dog-facts.html\n"));
        assert!(journal.contains("hero-photo.jpg\n"));

        // Both are now known slugs: misses, not NotFound.
        assert!(site.handle("dog-facts.html").expect("handle").1.is_some());
        assert!(site.handle("hero-photo.jpg").expect("handle").1.is_some());
    }

    #[tokio::test]
    async fn unsafe_probe_marks_the_whole_site() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let model = Arc::new(FakeModel::new());
        *model.safety_verdict.lock() = "NO".to_string();
        let site = site_in(tmp.path(), Arc::clone(&model));

        let (_stub, generate) = site.handle(INDEX_SLUG).expect("handle");
        let serve = generate.expect("miss")(noop_progress()).await;
        let err = serve().await.expect_err("unsafe serve");
        assert!(err.is(SiteErrorCode::Unsafe));

        // Sticky for every subsequent handle.
        let err = match site.handle(INDEX_SLUG) {
            Err(err) => err,
            Ok(_) => panic!("sticky"),
        };
        assert!(err.is(SiteErrorCode::Unsafe));
        let err = match site.handle(NOT_FOUND_SLUG) {
            Err(err) => err,
            Ok(_) => panic!("sticky"),
        };
        assert!(err.is(SiteErrorCode::Unsafe));
        assert!(!tmp.path().join(crate::prompter::OUTLINE_TXT).exists());
    }

    #[tokio::test]
    async fn image_slugs_are_reencoded_as_jpeg_with_retries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join(LINKS_TXT), "goat-hero.jpg\n").expect("seed journal");
        let model = Arc::new(FakeModel::new());
        model
            .png_failures
            .store(2, std::sync::atomic::Ordering::SeqCst);
        let site = site_in(tmp.path(), Arc::clone(&model));

        let payload = run_generate(&site, "goat-hero.jpg").await;
        assert_eq!(payload.status, StatusCode::OK);
        assert_eq!(payload.content_type, "image/jpeg");
        assert_eq!(&payload.body[..2], &[0xff, 0xd8], "jpeg magic");
        assert_eq!(model.png_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn three_failed_image_attempts_surface_an_error_payload() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join(LINKS_TXT), "goat-hero.jpg\n").expect("seed journal");
        let model = Arc::new(FakeModel::new());
        model
            .png_failures
            .store(3, std::sync::atomic::Ordering::SeqCst);
        let site = site_in(tmp.path(), Arc::clone(&model));

        let payload = run_generate(&site, "goat-hero.jpg").await;
        assert_eq!(payload.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(model.png_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn journal_duplicates_and_blanks_are_tolerated() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join(LINKS_TXT),
            "a.html\n\na.html\n  \nb.jpg\n",
        )
        .expect("seed journal");
        let site = site_in(tmp.path(), Arc::new(FakeModel::new()));

        assert!(site.handle("a.html").expect("handle").1.is_some());
        assert!(site.handle("b.jpg").expect("handle").1.is_some());
        assert!(site.handle("c.html").is_err());
    }

    #[tokio::test]
    async fn size_mismatch_on_disk_is_an_unexpected_size_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join(LINKS_TXT), "page.html\n").expect("seed journal");
        std::fs::write(tmp.path().join("page.html"), b"0123456789").expect("seed page");
        let site = site_in(tmp.path(), Arc::new(FakeModel::new()));

        let (serve, generate) = site.handle("page.html").expect("handle");
        assert!(generate.is_none());

        std::fs::write(tmp.path().join("page.html"), b"01234").expect("truncate");
        let err = serve().await.expect_err("mismatch");
        assert!(err.is(SiteErrorCode::UnexpectedSize));
    }

    #[tokio::test]
    async fn second_generator_returns_the_cached_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let model = Arc::new(FakeModel::new());
        let site = site_in(tmp.path(), Arc::clone(&model));

        // Two generators taken for the same miss before either runs.
        let (_s1, g1) = site.handle(INDEX_SLUG).expect("handle");
        let (_s2, g2) = site.handle(INDEX_SLUG).expect("handle");

        let first = g1.expect("miss")(noop_progress()).await;
        let first = first().await.expect("first serve");
        let second = g2.expect("miss")(noop_progress()).await;
        let second = second().await.expect("second serve");

        assert_eq!(first.body, second.body);
        assert_eq!(model.html_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
