use super::Timeouts;
use super::stream::{Io, ShapedIo, UpstreamStream};
use crate::events::ExchangeListener;
use crate::policy::BandwidthLimits;
use crate::router::{ChainedProxyRouter, Route, UpstreamProxy};
use http::Uri;
use http::uri::Scheme;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Monotonic stamps of each phase of opening a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectTimings {
    pub resolution_started: Option<Instant>,
    pub resolved: Option<Instant>,
    pub address: Option<IpAddr>,
    pub queued: Option<Instant>,
    pub connection_started: Option<Instant>,
    pub ssl_started: Option<Instant>,
    pub ssl_succeeded: Option<Instant>,
    pub connected: Option<Instant>,
}

impl ConnectTimings {
    /// Deliver the stamps collected so far as exchange callbacks
    pub fn replay(&self, listener: &dyn ExchangeListener) {
        if let Some(at) = self.resolution_started {
            listener.resolution_started(at);
        }
        if let (Some(at), Some(address)) = (self.resolved, self.address) {
            listener.resolution_succeeded(at, address);
        }
        if let Some(at) = self.queued {
            listener.connection_queued(at);
        }
        if let Some(at) = self.connection_started {
            listener.connection_started(at);
        }
        if let Some(at) = self.ssl_started {
            listener.ssl_started(at);
        }
        if let Some(at) = self.ssl_succeeded {
            listener.ssl_succeeded(at);
        }
        if let Some(at) = self.connected {
            listener.connection_succeeded(at);
        }
    }
}

/// Attached to every response received on a connection
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    timings: Arc<ConnectTimings>,
    claimed: Arc<AtomicBool>,
}

impl ConnectInfo {
    fn new(timings: ConnectTimings) -> Self {
        Self {
            timings: Arc::new(timings),
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The connection's timings, for the first exchange that asks only.
    /// Later exchanges on the same connection are reusing it.
    pub fn claim(&self) -> Option<&ConnectTimings> {
        (!self.claimed.swap(true, Ordering::AcqRel)).then_some(self.timings.as_ref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Unable to resolve host {host}")]
    Resolution {
        host: String,
        at: Instant,
        timings: ConnectTimings,
    },

    #[error("Unable to connect to host {host}: {reason}")]
    Connection {
        host: String,
        reason: String,
        at: Instant,
        timings: ConnectTimings,
    },

    #[error("Invalid upstream URI: {0}")]
    InvalidUri(String),
}

impl ConnectError {
    /// Deliver the stamps and the failure itself as exchange callbacks
    pub fn replay(&self, listener: &dyn ExchangeListener) {
        match self {
            ConnectError::Resolution { host, at, timings } => {
                timings.replay(listener);
                listener.resolution_failed(*at, host);
            }
            ConnectError::Connection {
                host, at, timings, ..
            } => {
                timings.replay(listener);
                listener.connection_failed(*at, host);
            }
            ConnectError::InvalidUri(_) => {}
        }
    }
}

/// Opens upstream connections: directly or through the chained proxy
#[derive(Clone)]
pub struct UpstreamConnector {
    router: Arc<ChainedProxyRouter>,
    tls: TlsConnector,
    timeouts: Arc<Timeouts>,
    bandwidth: Arc<BandwidthLimits>,
}

impl UpstreamConnector {
    pub fn new(
        router: Arc<ChainedProxyRouter>,
        tls: Arc<ClientConfig>,
        timeouts: Arc<Timeouts>,
        bandwidth: Arc<BandwidthLimits>,
    ) -> Self {
        Self {
            router,
            tls: TlsConnector::from(tls),
            timeouts,
            bandwidth,
        }
    }

    async fn connect(self, dst: Uri) -> Result<UpstreamStream, ConnectError> {
        let host = dst
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| ConnectError::InvalidUri(dst.to_string()))?;
        let https = dst.scheme() == Some(&Scheme::HTTPS);
        let port = dst.port_u16().unwrap_or(if https { 443 } else { 80 });

        let route = self.router.route_for(&host);
        let (dial_host, dial_port) = match &route {
            Route::Direct => (host.clone(), port),
            Route::Upstream(proxy) => (proxy.host().to_string(), proxy.port()),
        };
        tracing::debug!("Connecting to {}:{} via {:?}", host, port, route);

        let mut timings = ConnectTimings::default();
        let address = resolve(&dial_host, dial_port, &mut timings).await?;

        let established = self.establish(address, &dial_host, &host, port, https, &route, &mut timings);
        let io = match self.timeouts.connect() {
            Some(limit) => match tokio::time::timeout(limit, established).await {
                Ok(result) => result,
                Err(_) => Err(format!("timed out after {} ms", limit.as_millis())),
            },
            None => established.await,
        }
        .map_err(|reason| ConnectError::Connection {
            host: dial_host.clone(),
            reason,
            at: Instant::now(),
            timings: timings.clone(),
        })?;
        timings.connected = Some(Instant::now());

        let via_proxy = matches!(route, Route::Upstream(_)) && !https;
        let shaped = ShapedIo::new(io, self.timeouts.idle(), Arc::clone(&self.bandwidth));
        Ok(UpstreamStream::new(shaped, ConnectInfo::new(timings), via_proxy))
    }

    /// TCP connect, then the upstream proxy's TLS and tunnel, then TLS to the origin
    #[allow(clippy::too_many_arguments)]
    async fn establish(
        &self,
        address: SocketAddr,
        dial_host: &str,
        host: &str,
        port: u16,
        https: bool,
        route: &Route,
        timings: &mut ConnectTimings,
    ) -> Result<Box<dyn Io>, String> {
        timings.queued = Some(Instant::now());
        timings.connection_started = Some(Instant::now());
        let tcp = TcpStream::connect(address).await.map_err(|e| e.to_string())?;
        if let Err(e) = tcp.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }
        let mut io: Box<dyn Io> = Box::new(tcp);

        if let Route::Upstream(proxy) = route {
            if self.router.use_tls() {
                io = self.handshake(io, dial_host).await?;
            }
            if https {
                io = tunnel(io, host, port, proxy).await?;
            }
        }

        if https {
            timings.ssl_started = Some(Instant::now());
            io = self.handshake(io, host).await?;
            timings.ssl_succeeded = Some(Instant::now());
        }
        Ok(io)
    }

    async fn handshake(&self, io: Box<dyn Io>, server: &str) -> Result<Box<dyn Io>, String> {
        let name = ServerName::try_from(server.to_string())
            .map_err(|e| format!("invalid server name '{}': {}", server, e))?;
        let tls = self
            .tls
            .connect(name, io)
            .await
            .map_err(|e| format!("TLS handshake with {} failed: {}", server, e))?;
        Ok(Box::new(tls))
    }
}

impl tower::Service<Uri> for UpstreamConnector {
    type Response = UpstreamStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        Box::pin(self.clone().connect(dst))
    }
}

async fn resolve(
    host: &str,
    port: u16,
    timings: &mut ConnectTimings,
) -> Result<SocketAddr, ConnectError> {
    let started = Instant::now();
    timings.resolution_started = Some(started);

    let address = match host.parse::<IpAddr>() {
        Ok(ip) => Some(SocketAddr::new(ip, port)),
        Err(_) => match tokio::net::lookup_host((host, port)).await {
            Ok(mut addresses) => addresses.next(),
            Err(e) => {
                tracing::debug!("DNS lookup of {} failed: {}", host, e);
                None
            }
        },
    };

    match address {
        Some(address) => {
            // Literal addresses resolve instantly
            let resolved = if host.parse::<IpAddr>().is_ok() { started } else { Instant::now() };
            timings.resolved = Some(resolved);
            timings.address = Some(address.ip());
            Ok(address)
        }
        None => Err(ConnectError::Resolution {
            host: host.to_string(),
            at: Instant::now(),
            timings: timings.clone(),
        }),
    }
}

/// Open a CONNECT tunnel through the upstream proxy
async fn tunnel(
    mut io: Box<dyn Io>,
    host: &str,
    port: u16,
    proxy: &UpstreamProxy,
) -> Result<Box<dyn Io>, String> {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", authority);
    if let Some(authorization) = proxy.authorization() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", authorization));
    }
    request.push_str("\r\n");
    io.write_all(request.as_bytes())
        .await
        .map_err(|e| format!("CONNECT to {} failed: {}", proxy.address(), e))?;

    // Read the response head byte-wise so nothing past it is consumed
    let mut reader = BufReader::with_capacity(1, io);
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| format!("CONNECT to {} failed: {}", proxy.address(), e))?;
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if status != "200" {
        return Err(format!(
            "upstream proxy {} refused CONNECT: {}",
            proxy.address(),
            status_line.trim()
        ));
    }
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| format!("CONNECT to {} failed: {}", proxy.address(), e))?;
        if read == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }
    Ok(reader.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Calls(Mutex<Vec<&'static str>>);

    impl ExchangeListener for Calls {
        fn resolution_started(&self, _at: Instant) {
            self.0.lock().push("dns-start");
        }
        fn resolution_failed(&self, _at: Instant, _host: &str) {
            self.0.lock().push("dns-failed");
        }
        fn connection_started(&self, _at: Instant) {
            self.0.lock().push("connect-start");
        }
        fn connection_failed(&self, _at: Instant, _host: &str) {
            self.0.lock().push("connect-failed");
        }
    }

    #[tokio::test]
    async fn test_literal_address_resolves_instantly() {
        let mut timings = ConnectTimings::default();
        let address = resolve("127.0.0.1", 8080, &mut timings).await.unwrap();
        assert_eq!(address.port(), 8080);
        assert_eq!(timings.resolution_started, timings.resolved);
    }

    #[tokio::test]
    async fn test_resolution_failure_replays() {
        let mut timings = ConnectTimings::default();
        let err = resolve("skua-test.invalid", 80, &mut timings).await.unwrap_err();
        assert!(matches!(err, ConnectError::Resolution { .. }));

        let calls = Calls::default();
        err.replay(&calls);
        assert_eq!(*calls.0.lock(), vec!["dns-start", "dns-failed"]);
    }

    #[test]
    fn test_connect_info_claimed_once() {
        let info = ConnectInfo::new(ConnectTimings::default());
        let reused = info.clone();
        assert!(info.claim().is_some());
        assert!(reused.claim().is_none());
    }

    #[tokio::test]
    async fn test_tunnel_sends_proxy_authorization() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let proxy = UpstreamProxy::parse(&addr.to_string())
            .unwrap()
            .with_credentials("u", "p");
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut io = tunnel(Box::new(stream), "example.com", 443, &proxy).await.unwrap();

        let mut rest = [0u8; 5];
        io.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
    }

    #[tokio::test]
    async fn test_refused_tunnel_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await;
        });

        let proxy = UpstreamProxy::parse(&addr.to_string()).unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let err = tunnel(Box::new(stream), "example.com", 443, &proxy)
            .await
            .err()
            .unwrap();
        assert!(err.contains("407"));
    }
}
