// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use extempore_core::{SiteError, SiteErrorCode, CONTENT_TYPE_HTML, EXTENSION_HTML, INDEX_SLUG, NOT_FOUND_SLUG};
use extempore_genai::ProgressFn;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, warn};

use crate::progress_writer::ProgressWriter;
use crate::site::{serve_payload, GenerateFn, Payload, ServeFn, SiteHandler};
use crate::worker_pool::WorkerPool;

const PROGRESS_CHANNEL_CAPACITY: usize = 4;

struct Waiter {
    progress_tx: mpsc::Sender<String>,
    result_tx: mpsc::Sender<ServeFn>,
}

/// Per-site HTTP dispatcher: collapses concurrent requests for the same
/// slug into one generation, mirrors progress to every waiter, and hands
/// each of them the final serve function.
pub struct SiteServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    site: Arc<dyn SiteHandler>,
    pool: Arc<WorkerPool>,
    progress_writer: Arc<dyn ProgressWriter>,
    unsafe_serve: ServeFn,
    pending: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl SiteServer {
    #[must_use]
    pub fn new(
        site: Arc<dyn SiteHandler>,
        pool: Arc<WorkerPool>,
        progress_writer: Arc<dyn ProgressWriter>,
        unsafe_serve: ServeFn,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                site,
                pool,
                progress_writer,
                unsafe_serve,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Serve one request for an in-site path (already stripped of the
    /// prefix). The empty path is the site index.
    pub async fn respond(&self, path: &str) -> Response {
        let slug = if path.is_empty() { INDEX_SLUG } else { path };

        let (serve, generate) = match self.inner.site.handle(slug) {
            Ok(handled) => handled,
            Err(err) if err.is(SiteErrorCode::Unsafe) => (self.inner.unsafe_serve.clone(), None),
            Err(err) if err.is(SiteErrorCode::NotFound) => {
                match self.inner.site.handle(NOT_FOUND_SLUG) {
                    Ok(handled) => handled,
                    Err(err) => return internal_error_response(slug, &err),
                }
            }
            Err(err) => return internal_error_response(slug, &err),
        };

        let Some(generate) = generate else {
            return self.inner.run_serve(slug, &serve).await;
        };

        let (progress_rx, result_rx) = match self.inner.register(slug, generate) {
            Ok(channels) => channels,
            Err(err) => return internal_error_response(slug, &err),
        };

        if slug.ends_with(EXTENSION_HTML) {
            self.inner
                .respond_with_progress(slug, progress_rx, result_rx)
                .await
        } else {
            self.inner.respond_without_progress(serve, result_rx).await
        }
    }

    /// Number of slugs with in-flight generations. Test hook.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of registered waiters for one slug. Test hook.
    #[must_use]
    pub fn pending_waiters(&self, slug: &str) -> usize {
        self.inner
            .pending
            .lock()
            .get(slug)
            .map_or(0, Vec::len)
    }
}

impl ServerInner {
    /// Register the caller as a waiter for `slug`. The first waiter submits
    /// the generator to the pool; a full pool rejects the whole request.
    fn register(
        self: &Arc<Self>,
        slug: &str,
        generate: GenerateFn,
    ) -> Result<(mpsc::Receiver<String>, mpsc::Receiver<ServeFn>), SiteError> {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = mpsc::channel(1);

        let mut pending = self.pending.lock();
        let waiters = pending.entry(slug.to_string()).or_default();
        let first = waiters.is_empty();
        waiters.push(Waiter {
            progress_tx,
            result_tx,
        });

        if first {
            let job = Self::generate_job(Arc::clone(self), slug.to_string(), generate);
            if !self.pool.try_submit(job) {
                pending.remove(slug);
                return Err(SiteError::over_capacity());
            }
        }

        Ok((progress_rx, result_rx))
    }

    /// The pool work item: run the generator (detached from any request
    /// context), contain panics, then detach the waiter list and deliver the
    /// final serve function to everyone.
    async fn generate_job(inner: Arc<Self>, slug: String, generate: GenerateFn) {
        let progress: ProgressFn = {
            let inner = Arc::clone(&inner);
            let slug = slug.clone();
            Arc::new(move |text: &str| {
                let pending = inner.pending.lock();
                if let Some(waiters) = pending.get(&slug) {
                    for waiter in waiters {
                        // Full channels drop chunks; progress is best-effort.
                        let _ = waiter.progress_tx.try_send(text.to_string());
                    }
                }
            })
        };

        let serve = match tokio::spawn(generate(progress)).await {
            Ok(serve) => serve,
            Err(err) => {
                let err = SiteError::generate_panic(panic_message(err));
                error!(slug = %slug, "{err}");
                serve_payload(Payload::internal_error(err.to_string()))
            }
        };

        let waiters = inner.pending.lock().remove(&slug).unwrap_or_default();
        for waiter in waiters {
            // A failed send means the waiter's request was abandoned.
            let _ = waiter.result_tx.try_send(serve.clone());
        }
    }

    /// Run a serve function as the whole response. `Unsafe` reroutes to the
    /// unsafe handler; anything else failing is a 500.
    async fn run_serve(&self, slug: &str, serve: &ServeFn) -> Response {
        match serve().await {
            Ok(payload) => payload.into_response(),
            Err(err) if err.is(SiteErrorCode::Unsafe) => match (self.unsafe_serve)().await {
                Ok(payload) => payload.into_response(),
                Err(err) => internal_error_response(slug, &err),
            },
            Err(err) => internal_error_response(slug, &err),
        }
    }

    /// Non-HTML miss: early 202 headers, then the final body bytes once the
    /// generator delivers. Headers of the final payload are already spoken
    /// for by the stub.
    async fn respond_without_progress(
        &self,
        stub: ServeFn,
        mut result_rx: mpsc::Receiver<ServeFn>,
    ) -> Response {
        let head = match stub().await {
            Ok(payload) => payload,
            Err(err) => return internal_error_response("", &err),
        };

        let body = Body::from_stream(stream! {
            if let Some(serve) = result_rx.recv().await {
                match serve().await {
                    Ok(payload) => yield Ok::<Bytes, Infallible>(payload.body),
                    Err(err) => warn!("failed to serve generated bytes: {err}"),
                }
            }
        });

        response_with_streaming_body(head.status, head.content_type, body)
    }

    /// HTML miss: if the result beats the first progress chunk, serve it
    /// directly; otherwise ship the progress shell and stream chunk scripts
    /// until the finisher.
    async fn respond_with_progress(
        self: &Arc<Self>,
        slug: &str,
        mut progress_rx: mpsc::Receiver<String>,
        mut result_rx: mpsc::Receiver<ServeFn>,
    ) -> Response {
        let first = tokio::select! {
            biased;
            chunk = progress_rx.recv() => match chunk {
                Some(chunk) => StreamEvent::Chunk(chunk),
                None => StreamEvent::ProgressClosed,
            },
            result = result_rx.recv() => StreamEvent::Result(result),
        };
        let first_chunk = match first {
            StreamEvent::Chunk(chunk) => chunk,
            StreamEvent::Result(Some(serve)) => return self.run_serve(slug, &serve).await,
            // Progress senders gone: the result is either queued or lost.
            StreamEvent::ProgressClosed | StreamEvent::Result(None) => {
                return match result_rx.recv().await {
                    Some(serve) => self.run_serve(slug, &serve).await,
                    None => {
                        internal_error_response(slug, &SiteError::io("generator vanished"))
                    }
                }
            }
        };

        let writer = Arc::clone(&self.progress_writer);
        let body = Body::from_stream(stream! {
            yield Ok::<Bytes, Infallible>(writer.start());
            yield Ok(writer.chunk(&first_chunk));
            loop {
                let event = tokio::select! {
                    biased;
                    chunk = progress_rx.recv() => match chunk {
                        Some(chunk) => StreamEvent::Chunk(chunk),
                        None => StreamEvent::ProgressClosed,
                    },
                    result = result_rx.recv() => StreamEvent::Result(result),
                };
                match event {
                    StreamEvent::Chunk(chunk) => yield Ok(writer.chunk(&chunk)),
                    // Senders dropped: the result is imminent.
                    StreamEvent::ProgressClosed => {
                        if let Some(serve) = result_rx.recv().await {
                            yield Ok(writer.finish(serve).await);
                        }
                        break;
                    }
                    StreamEvent::Result(Some(serve)) => {
                        yield Ok(writer.finish(serve).await);
                        break;
                    }
                    StreamEvent::Result(None) => break,
                }
            }
        });

        response_with_streaming_body(StatusCode::ACCEPTED, CONTENT_TYPE_HTML, body)
    }
}

enum StreamEvent {
    Chunk(String),
    ProgressClosed,
    Result(Option<ServeFn>),
}

fn response_with_streaming_body(
    status: StatusCode,
    content_type: &'static str,
    body: Body,
) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn internal_error_response(slug: &str, err: &SiteError) -> Response {
    error!(slug = %slug, "request failed: {err}");
    Payload::internal_error(err.to_string()).into_response()
}

fn panic_message(err: JoinError) -> String {
    if err.is_panic() {
        let panic = err.into_panic();
        if let Some(message) = panic.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = panic.downcast_ref::<String>() {
            message.clone()
        } else {
            "opaque panic payload".to_string()
        }
    } else {
        err.to_string()
    }
}
