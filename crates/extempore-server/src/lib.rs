// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! An improvisational web server: every path under a site prefix is a
//! generation request. Misses are synthesized by a model, sanitized,
//! persisted, and served; hits come straight off disk, immutable.

mod fake_model;
mod file;
mod gateway;
mod progress_writer;
mod prompter;
mod server;
mod site;
mod transform;
mod worker_pool;

pub use fake_model::FakeModel;
pub use file::{append_contents, write_file_atomic, SiteDir};
pub use gateway::Gateway;
pub use progress_writer::{DefaultProgressWriter, ProgressWriter};
pub use prompter::Prompter;
pub use server::SiteServer;
pub use site::{
    GenerateFn, GenerateFuture, HtmlTransformFn, Payload, ServeFn, ServeFuture, Site, SiteHandler,
    CACHE_CONTROL_IMMUTABLE,
};
pub use transform::{default_transformer, SOCIAL_CARD_SLUG};
pub use worker_pool::WorkerPool;

pub use extempore_core::{SiteError, SiteErrorCode};

pub const CRATE_NAME: &str = "extempore-server";

/// Pool sizing defaults: the worker count bounds concurrent generations and
/// the queue holds ten submissions per worker before admission fails.
pub const DEFAULT_NUM_WORKERS: usize = 100;
pub const DEFAULT_QUEUE_PER_WORKER: usize = 10;
