use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use skua_proxy::{CertificateAuthority, ProxyConfig, ProxyServer};
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Origin that answers with the request path and the `x-injected` header
async fn start_origin() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                    let injected = req
                        .headers()
                        .get("x-injected")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("none")
                        .to_string();
                    let body = format!("path={} injected={}", req.uri().path(), injected);
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn start_proxy() -> (ProxyServer, SocketAddr) {
    let ca = CertificateAuthority::generate().unwrap();
    let server = ProxyServer::new(ProxyConfig::default(), ca).unwrap();
    let addr = server
        .start_on(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .unwrap();
    (server, addr)
}

struct Reply {
    status: u16,
    body: String,
}

/// Send an absolute-form GET through the proxy and read until it closes
async fn get(proxy: SocketAddr, url: &str) -> Reply {
    let host = url
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap()
        .to_string();
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", url, host);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Reply { status, body }
}

async fn settle(server: &ProxyServer) {
    assert!(
        server
            .wait_for_quiescence(Duration::from_millis(100), Duration::from_secs(5))
            .await
    );
}

#[tokio::test]
async fn test_exchange_recorded_on_named_page() {
    let origin = start_origin().await;
    let (server, proxy) = start_proxy().await;
    server.new_har(Some("step1"), None);

    let reply = get(proxy, &format!("http://{}/hello", origin)).await;
    assert_eq!(reply.status, 200);
    assert!(reply.body.contains("path=/hello"));
    settle(&server).await;

    let har = server.get_har(false).unwrap().snapshot();
    assert_eq!(har.log.pages.len(), 1);
    assert_eq!(har.log.pages[0].id, "step1");
    assert_eq!(har.log.entries.len(), 1);

    let entry = &har.log.entries[0];
    assert_eq!(entry.page_ref.as_deref(), Some("step1"));
    assert_eq!(entry.request.method, "GET");
    assert_eq!(entry.response.status, 200);
    assert!(entry.timings.wait >= 0);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_blocklisted_request_is_answered_and_recorded() {
    let origin = start_origin().await;
    let (server, proxy) = start_proxy().await;
    server.new_har(None, None);
    server.blocklist_request(".*/blocked.*", 418, None).unwrap();

    let reply = get(proxy, &format!("http://{}/blocked/page", origin)).await;
    assert_eq!(reply.status, 418);
    assert!(reply.body.is_empty());
    settle(&server).await;

    let entry = server.find_most_recent_entry(".*/blocked.*").unwrap().unwrap();
    assert_eq!(entry.response.status, 418);

    // Other URLs still reach the origin
    let reply = get(proxy, &format!("http://{}/open", origin)).await;
    assert_eq!(reply.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_enabled_allowlist_without_patterns_rejects_everything() {
    let origin = start_origin().await;
    let (server, proxy) = start_proxy().await;
    server.enable_allowlist(&[], 451).unwrap();

    let reply = get(proxy, &format!("http://{}/anything", origin)).await;
    assert_eq!(reply.status, 451);

    server.disable_allowlist();
    let reply = get(proxy, &format!("http://{}/anything", origin)).await;
    assert_eq!(reply.status, 200);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_rewritten_url_keeps_original() {
    let origin = start_origin().await;
    let (server, proxy) = start_proxy().await;
    server.new_har(None, None);
    server.rewrite_url("(.*)/old", "$1/new").unwrap();

    let original = format!("http://{}/old", origin);
    let reply = get(proxy, &original).await;
    assert_eq!(reply.status, 200);
    assert!(reply.body.contains("path=/new"));
    settle(&server).await;

    let entry = server.find_most_recent_entry(".*/new").unwrap().unwrap();
    assert_eq!(entry.request.url, format!("http://{}/new", origin));
    assert_eq!(entry.additional_str("_url"), Some(original.as_str()));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_additional_headers_reach_origin() {
    let origin = start_origin().await;
    let (server, proxy) = start_proxy().await;
    server.add_header("X-Injected", "yes").unwrap();

    let reply = get(proxy, &format!("http://{}/headers", origin)).await;
    assert!(reply.body.contains("injected=yes"));

    assert!(server.remove_header("x-injected"));
    let reply = get(proxy, &format!("http://{}/headers", origin)).await;
    assert!(reply.body.contains("injected=none"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_refused_connection_is_recorded_as_failure() {
    let (server, proxy) = start_proxy().await;
    server.new_har(None, None);

    let reply = get(proxy, "http://127.0.0.1:1/unreachable").await;
    assert_eq!(reply.status, 502);
    settle(&server).await;

    let entry = server.find_most_recent_entry(".*/unreachable").unwrap().unwrap();
    assert_eq!(entry.response.status, 0);
    assert_eq!(entry.response.headers_size, -1);
    assert!(
        entry
            .additional_str("_errorMessage")
            .unwrap()
            .starts_with("Unable to connect")
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_latency_delays_exchange() {
    let origin = start_origin().await;
    let (server, proxy) = start_proxy().await;
    server.set_latency(Duration::from_millis(200));

    let started = Instant::now();
    let reply = get(proxy, &format!("http://{}/slow", origin)).await;
    assert_eq!(reply.status, 200);
    assert!(started.elapsed() >= Duration::from_millis(200));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_end_har_returns_capture_and_resets() {
    let origin = start_origin().await;
    let (server, proxy) = start_proxy().await;
    server.new_har(Some("first"), Some("First page"));

    get(proxy, &format!("http://{}/one", origin)).await;
    server.new_page(Some("second"), None);
    get(proxy, &format!("http://{}/two", origin)).await;
    settle(&server).await;

    let har = server.end_har().unwrap().snapshot();
    assert_eq!(har.log.pages.len(), 2);
    assert_eq!(har.log.entries.len(), 2);
    assert_eq!(har.log.entries[1].page_ref.as_deref(), Some("second"));
    assert!(server.get_har(false).is_none());

    server.stop().await.unwrap();
}
