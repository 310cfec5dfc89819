// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;
use extempore_core::SiteErrorCode;

use crate::site::ServeFn;

/// Emits the live-progress HTML shell for a miss: a bootstrap prelude, one
/// inline script per streamed chunk, and a finisher that either reloads the
/// page or snapshots an error in-band.
#[async_trait]
pub trait ProgressWriter: Send + Sync {
    fn start(&self) -> Bytes;
    fn chunk(&self, text: &str) -> Bytes;
    async fn finish(&self, serve: ServeFn) -> Bytes;
}

const PRELUDE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <title>Progress</title>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  <style>
    html, body {
      margin: 0;
      padding: 0;
      height: 100%;
      overflow: hidden;
      margin: 0 auto;
    }
    #progress {
      box-sizing: border-box;
      width: 100vw; height: 100vh;
      padding: 1rem;
      font-family: Menlo, monospace;
      font-size: 1rem;
      line-height: 1.4;
      overflow-y: scroll;
      scrollbar-width: none;
    }
    #progress::-webkit-scrollbar { width: 0; height: 0; }
  </style>
</head>
<body>
  <div id="progress" style="white-space: pre;"></div>
"#;

const RELOAD: &str = "<script>location.reload();</script></body></html>";

pub struct DefaultProgressWriter;

#[async_trait]
impl ProgressWriter for DefaultProgressWriter {
    fn start(&self) -> Bytes {
        Bytes::from_static(PRELUDE.as_bytes())
    }

    fn chunk(&self, text: &str) -> Bytes {
        text_script(text, true)
    }

    /// Run the final serve function against a capture and decide how to end
    /// the stream: a reload when the artifact is ready (or the site turned
    /// unsafe, so the refetch hits the unsafe handler), an in-band snapshot
    /// for anything else.
    async fn finish(&self, serve: ServeFn) -> Bytes {
        match serve().await {
            Err(err) if err.is(SiteErrorCode::Unsafe) => Bytes::from_static(RELOAD.as_bytes()),
            Err(err) => text_script(&err.to_string(), false),
            Ok(payload) => match payload.status.as_u16() {
                200 | 202 => Bytes::from_static(RELOAD.as_bytes()),
                code => {
                    let body = String::from_utf8_lossy(&payload.body);
                    text_script(&format!("{code}\n\n{body}"), false)
                }
            },
        }
    }
}

/// An inline script that sets or appends the progress container's text. The
/// payload rides inside the script as a JSON string literal.
fn text_script(text: &str, append: bool) -> Bytes {
    let Ok(encoded) = serde_json::to_string(text) else {
        return Bytes::new();
    };
    let operator = if append { "+=" } else { "=" };
    Bytes::from(format!(
        r#"<script>
(function(){{
  var prog = document.getElementById("progress");
  prog.textContent {operator} {encoded};
  prog.scrollTop = prog.scrollHeight;
}})();
</script>"#
    ))
}
