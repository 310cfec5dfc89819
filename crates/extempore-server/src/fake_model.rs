// SPDX-License-Identifier: Apache-2.0

//! In-process stand-in for the model boundary, used by tests and local
//! experiments.

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use extempore_genai::{ModelClient, ModelError, ProgressFn};
use parking_lot::Mutex;

pub struct FakeModel {
    pub safety_verdict: Mutex<String>,
    pub outline: Mutex<String>,
    pub html_body: Mutex<String>,
    pub png_bytes: Mutex<Vec<u8>>,
    /// Number of `png` calls that fail before one succeeds.
    pub png_failures: AtomicUsize,
    /// Extra chunks mirrored to the progress sink before an `html` result.
    pub html_progress: Mutex<Vec<String>>,
    /// When set, `html` blocks on a permit before completing. Lets tests
    /// pile up waiters behind a single in-flight generation.
    pub html_release: Mutex<Option<Arc<tokio::sync::Semaphore>>>,
    pub text_calls: AtomicUsize,
    pub html_calls: AtomicUsize,
    pub png_calls: AtomicUsize,
}

impl FakeModel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            safety_verdict: Mutex::new("SAFE".to_string()),
            outline: Mutex::new("# Test Site Outline".to_string()),
            html_body: Mutex::new(
                "<html><head><title>stub</title></head><body><h1>Generated</h1></body></html>"
                    .to_string(),
            ),
            png_bytes: Mutex::new(one_pixel_png()),
            png_failures: AtomicUsize::new(0),
            html_progress: Mutex::new(Vec::new()),
            html_release: Mutex::new(None),
            text_calls: AtomicUsize::new(0),
            html_calls: AtomicUsize::new(0),
            png_calls: AtomicUsize::new(0),
        }
    }
}

impl Default for FakeModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    async fn text(&self, prompt: &str, progress: &ProgressFn) -> Result<String, ModelError> {
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        let reply = if prompt.contains("respond with the single word") {
            self.safety_verdict.lock().clone()
        } else {
            self.outline.lock().clone()
        };
        progress(&reply);
        Ok(reply)
    }

    async fn html(&self, _prompt: &str, progress: &ProgressFn) -> Result<String, ModelError> {
        self.html_calls.fetch_add(1, Ordering::SeqCst);
        for chunk in self.html_progress.lock().iter() {
            progress(chunk);
        }
        let gate = self.html_release.lock().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await;
        }
        let body = self.html_body.lock().clone();
        progress(&body);
        Ok(body)
    }

    async fn png(&self, _prompt: &str, progress: &ProgressFn) -> Result<Vec<u8>, ModelError> {
        self.png_calls.fetch_add(1, Ordering::SeqCst);
        if self.png_failures.load(Ordering::SeqCst) > 0 {
            self.png_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(ModelError::transport("synthetic image failure"));
        }
        progress("painting\n");
        Ok(self.png_bytes.lock().clone())
    }
}

fn one_pixel_png() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        1,
        1,
        image::Rgb([200, 100, 50]),
    ));
    let mut out = Cursor::new(Vec::new());
    // Encoding a 1x1 RGB image into a memory buffer cannot fail.
    img.write_to(&mut out, image::ImageFormat::Png)
        .unwrap_or_default();
    out.into_inner()
}
