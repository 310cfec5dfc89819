// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use extempore_server::{FakeModel, Gateway, WorkerPool};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn start_gateway(model: Arc<FakeModel>) -> (std::net::SocketAddr, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let pool = Arc::new(WorkerPool::new(4, 32));
    let gateway = Gateway::new(tmp.path().to_path_buf(), String::new(), model, pool);
    let app = gateway.router();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve app");
    });
    (addr, tmp)
}

async fn get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write request");
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .await
        .expect("read response");
    String::from_utf8_lossy(&response).to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn landing_page_is_served_with_short_cache() {
    let (addr, _tmp) = start_gateway(Arc::new(FakeModel::new())).await;
    let response = get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.to_lowercase().contains("cache-control: public, max-age=10"));
    assert!(response.contains("extempore"));

    // /index.html is the same page.
    let response = get(addr, "/index.html").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test(flavor = "multi_thread")]
async fn static_assets_are_embedded() {
    let (addr, _tmp) = start_gateway(Arc::new(FakeModel::new())).await;

    let response = get(addr, "/robots.txt").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("User-agent: *"));
    assert!(response.to_lowercase().contains("cache-control: public, max-age=3600"));

    let response = get(addr, "/favicon.ico").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.to_lowercase().contains("content-type: image/x-icon"));

    let response = get(addr, "/banner.html").await;
    assert!(response.contains("AI-generated"));
}

#[tokio::test(flavor = "multi_thread")]
async fn bare_prefix_redirects_to_trailing_slash() {
    let (addr, _tmp) = start_gateway(Arc::new(FakeModel::new())).await;
    let response = get(addr, "/cats").await;
    assert!(
        response.starts_with("HTTP/1.1 301 Moved Permanently\r\n"),
        "{response}"
    );
    assert!(response.to_lowercase().contains("location: /cats/"));
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_prefixes_fall_through_to_the_not_found_page() {
    let (addr, tmp) = start_gateway(Arc::new(FakeModel::new())).await;

    for path in [
        "/Bad_Prefix!/index.html",
        "/UPPER/index.html",
        "/-dash-/x",
        "/this-prefix-is-way-too-long-to-be-accepted-anywhere/x",
    ] {
        let response = get(addr, path).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{path}: {response}");
        assert!(
            response.contains("not a site name"),
            "{path} should hit the embedded not-found page"
        );
    }

    // Nothing was created for any of the rejected prefixes.
    let dirs: Vec<_> = std::fs::read_dir(tmp.path())
        .expect("read content root")
        .collect();
    assert!(dirs.is_empty(), "content root should stay empty");
}

#[tokio::test(flavor = "multi_thread")]
async fn a_new_site_streams_progress_then_serves_the_cached_page() {
    let model = Arc::new(FakeModel::new());
    *model.html_body.lock() = concat!(
        "<html><head><title>cats</title></head>",
        "<body><h1>All About Cats</h1><a href=\"kitten-facts.html\">kittens</a></body></html>"
    )
    .to_string();
    let (addr, tmp) = start_gateway(Arc::clone(&model)).await;

    // First visit: the progress shell streams, then asks for a reload.
    let response = get(addr, "/cats/").await;
    assert!(response.starts_with("HTTP/1.1 202 Accepted\r\n"), "{response}");
    assert!(response.contains("id=\"progress\""), "{response}");
    assert!(response.contains("Generating index.html"), "{response}");
    assert!(response.contains("location.reload()"), "{response}");

    // The artifact is on disk, sanitized and transformed.
    let page = std::fs::read_to_string(tmp.path().join("cats/index.html")).expect("artifact");
    assert!(page.contains("All About Cats"));
    assert!(page.contains("/banner.html"));
    assert!(page.contains("colorful-social-card.jpg"));

    // The reload lands on a cache hit with immutable headers.
    let response = get(addr, "/cats/index.html").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response
        .to_lowercase()
        .contains("cache-control: public, max-age=31536000, immutable"));
    assert!(response.contains("All About Cats"));

    // Discovered links became known slugs in the journal.
    let journal = std::fs::read_to_string(tmp.path().join("cats/links.txt")).expect("journal");
    assert!(journal.contains("kitten-facts.html"));
    assert!(journal.contains("colorful-social-card.jpg"));

    // Exactly one outline and one page generation happened.
    assert_eq!(model.text_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(model.html_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unsafe_topics_get_the_safety_page_on_reload() {
    let model = Arc::new(FakeModel::new());
    *model.safety_verdict.lock() = "NO".to_string();
    let (addr, tmp) = start_gateway(Arc::clone(&model)).await;

    // The first request streams and finishes with a reload (the unsafe
    // verdict is only visible to the finisher).
    let response = get(addr, "/war-crimes/").await;
    assert!(response.starts_with("HTTP/1.1 202 Accepted\r\n"), "{response}");
    assert!(response.contains("location.reload()"), "{response}");

    // The reload hits the sticky unsafe handler.
    let response = get(addr, "/war-crimes/").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.contains("can't improvise on that topic"), "{response}");

    // No outline was persisted for the rejected site.
    assert!(!tmp.path().join("war-crimes/outline.txt").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn sites_api_lists_sites_with_social_cards() {
    let model = Arc::new(FakeModel::new());
    let (addr, tmp) = start_gateway(model).await;

    // No sites yet.
    let response = get(addr, "/api/sites").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.trim_end().ends_with("[]"), "{response}");

    // A site only shows up once its social card is materialized.
    std::fs::create_dir_all(tmp.path().join("cats")).expect("mkdir");
    std::fs::write(tmp.path().join("cats/colorful-social-card.jpg"), b"\xff\xd8stub")
        .expect("card");
    std::fs::create_dir_all(tmp.path().join("dogs")).expect("mkdir");

    let response = get(addr, "/api/sites").await;
    assert!(response.contains(r#""slug":"cats""#), "{response}");
    assert!(
        response.contains(r#""imagePath":"/cats/colorful-social-card.jpg""#),
        "{response}"
    );
    assert!(!response.contains(r#""slug":"dogs""#), "{response}");
}
