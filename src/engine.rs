use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use crate::error::{Error, TransportErrorKind};
use crate::trace::{ConnectionAcquired, ConnectionTracer, TracePhase};
use crate::util::{
    classify_hyper_error, classify_io_error, default_port, is_https, lock_unpoisoned,
    redact_uri_for_logs,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One attempt's input to the engine: a fully prepared request.
#[derive(Clone, Debug)]
pub struct EngineRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A fully buffered response as it came off the wire.
#[derive(Clone, Debug)]
pub struct EngineResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// The underlying HTTP engine collaborator.
///
/// An engine performs exactly one attempt and reports lifecycle phase
/// boundaries into the attempt's [`ConnectionTracer`] as they happen. The
/// caller owns timeouts and cancellation: dropping the returned future must
/// abort the in-flight attempt.
#[async_trait]
pub trait HttpEngine: Send + Sync {
    async fn execute(
        &self,
        request: EngineRequest,
        tracer: &mut ConnectionTracer,
    ) -> Result<EngineResponse, Error>;
}

#[derive(Clone, Debug)]
pub(crate) struct EngineConfig {
    pub danger_accept_invalid_certs: bool,
    pub local_addr: Option<IpAddr>,
    pub proxy: Option<Uri>,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub disable_keep_alive: bool,
}

type PoolKey = (String, String, u16);

struct IdleConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    idle_since: Instant,
}

struct EstablishedConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

/// Default engine: tokio DNS + TCP, rustls, hyper http1, with a small idle
/// pool of send handles per origin so sequential requests can reuse an
/// established connection.
pub struct HyperEngine {
    tls: TlsConnector,
    local_addr: Option<IpAddr>,
    proxy: Option<Uri>,
    pool: Mutex<HashMap<PoolKey, Vec<IdleConnection>>>,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    disable_keep_alive: bool,
}

impl HyperEngine {
    pub(crate) fn new(config: EngineConfig) -> Result<Self, Error> {
        let tls_config = build_tls_config(config.danger_accept_invalid_certs)?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(tls_config)),
            local_addr: config.local_addr,
            proxy: config.proxy,
            pool: Mutex::new(HashMap::new()),
            pool_idle_timeout: config.pool_idle_timeout,
            pool_max_idle_per_host: config.pool_max_idle_per_host,
            disable_keep_alive: config.disable_keep_alive,
        })
    }

    fn checkout(&self, key: &PoolKey) -> Option<IdleConnection> {
        let mut pool = lock_unpoisoned(&self.pool);
        let idle = pool.get_mut(key)?;
        while let Some(connection) = idle.pop() {
            if connection.idle_since.elapsed() > self.pool_idle_timeout {
                continue;
            }
            if connection.sender.is_closed() || !connection.sender.is_ready() {
                continue;
            }
            return Some(connection);
        }
        None
    }

    fn check_in(&self, key: PoolKey, connection: IdleConnection) {
        let mut pool = lock_unpoisoned(&self.pool);
        let idle = pool.entry(key).or_default();
        if idle.len() < self.pool_max_idle_per_host {
            idle.push(connection);
        }
    }

    async fn resolve(
        &self,
        host: &str,
        port: u16,
        method: &Method,
        redacted_uri: &str,
        tracer: &mut ConnectionTracer,
    ) -> Result<SocketAddr, Error> {
        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare_host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        tracer.record(TracePhase::DnsStart);
        let mut resolved = lookup_host((bare_host, port)).await.map_err(|source| {
            transport_error(TransportErrorKind::Dns, method, redacted_uri, source)
        })?;
        tracer.record(TracePhase::DnsDone);
        resolved.next().ok_or_else(|| {
            transport_error(
                TransportErrorKind::Dns,
                method,
                redacted_uri,
                format!("no addresses resolved for {bare_host}"),
            )
        })
    }

    async fn connect_tcp(&self, remote: SocketAddr) -> std::io::Result<TcpStream> {
        match self.local_addr {
            Some(local) => {
                let socket = if remote.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.bind(SocketAddr::new(local, 0))?;
                socket.connect(remote).await
            }
            None => TcpStream::connect(remote).await,
        }
    }

    async fn tunnel(
        &self,
        stream: &mut TcpStream,
        host: &str,
        port: u16,
        method: &Method,
        redacted_uri: &str,
    ) -> Result<(), Error> {
        let connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
        stream.write_all(connect.as_bytes()).await.map_err(|source| {
            transport_error(TransportErrorKind::Connect, method, redacted_uri, source)
        })?;

        let mut head = Vec::with_capacity(256);
        let mut byte = [0_u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let read = stream.read(&mut byte).await.map_err(|source| {
                transport_error(TransportErrorKind::Connect, method, redacted_uri, source)
            })?;
            if read == 0 {
                return Err(transport_error(
                    TransportErrorKind::Connect,
                    method,
                    redacted_uri,
                    "proxy closed connection during tunnel handshake",
                ));
            }
            head.push(byte[0]);
            if head.len() > 8192 {
                return Err(transport_error(
                    TransportErrorKind::Connect,
                    method,
                    redacted_uri,
                    "oversized proxy tunnel response",
                ));
            }
        }

        let head_text = String::from_utf8_lossy(&head);
        let accepted = head_text
            .split_whitespace()
            .nth(1)
            .is_some_and(|code| code.starts_with('2'));
        if !accepted {
            let status_line = head_text.lines().next().unwrap_or_default().to_owned();
            return Err(transport_error(
                TransportErrorKind::Connect,
                method,
                redacted_uri,
                format!("proxy refused tunnel: {status_line}"),
            ));
        }
        Ok(())
    }

    async fn establish(
        &self,
        uri: &Uri,
        method: &Method,
        redacted_uri: &str,
        tracer: &mut ConnectionTracer,
    ) -> Result<EstablishedConnection, Error> {
        let https = is_https(uri);
        let host = uri.host().unwrap_or_default().to_owned();
        let port = default_port(uri);
        let (dial_host, dial_port) = match &self.proxy {
            Some(proxy) => (
                proxy.host().unwrap_or_default().to_owned(),
                proxy.port_u16().unwrap_or(80),
            ),
            None => (host.clone(), port),
        };

        let remote = self
            .resolve(&dial_host, dial_port, method, redacted_uri, tracer)
            .await?;
        tracer.record(TracePhase::ConnectStart);
        let mut stream = self.connect_tcp(remote).await.map_err(|source| {
            let kind = match classify_io_error(&source) {
                TransportErrorKind::Other => TransportErrorKind::Connect,
                kind => kind,
            };
            transport_error(kind, method, redacted_uri, source)
        })?;
        tracer.record(TracePhase::ConnectDone);
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();

        if https && self.proxy.is_some() {
            self.tunnel(&mut stream, &host, port, method, redacted_uri)
                .await?;
        }

        let sender = if https {
            tracer.record(TracePhase::TlsStart);
            let server_name = ServerName::try_from(host.clone()).map_err(|source| {
                transport_error(TransportErrorKind::Tls, method, redacted_uri, source)
            })?;
            let tls_stream = self.tls.connect(server_name, stream).await.map_err(|source| {
                transport_error(TransportErrorKind::Tls, method, redacted_uri, source)
            })?;
            tracer.record(TracePhase::TlsDone);
            spawn_http1(TokioIo::new(tls_stream), method, redacted_uri).await?
        } else {
            spawn_http1(TokioIo::new(stream), method, redacted_uri).await?
        };

        Ok(EstablishedConnection {
            sender,
            local_addr,
            remote_addr,
        })
    }
}

#[async_trait]
impl HttpEngine for HyperEngine {
    async fn execute(
        &self,
        request: EngineRequest,
        tracer: &mut ConnectionTracer,
    ) -> Result<EngineResponse, Error> {
        let method = request.method.clone();
        let redacted_uri = redact_uri_for_logs(&request.uri);
        let key = pool_key(&request.uri);

        tracer.record(TracePhase::GetConn);
        let (mut sender, local_addr, remote_addr) = match self.checkout(&key) {
            Some(idle) => {
                trace!(uri = %redacted_uri, "reusing pooled connection");
                tracer.record_connection(ConnectionAcquired {
                    local_addr: idle.local_addr,
                    remote_addr: idle.remote_addr,
                    reused: true,
                    was_idle: true,
                    idle_time: idle.idle_since.elapsed(),
                });
                (idle.sender, idle.local_addr, idle.remote_addr)
            }
            None => {
                let established = self
                    .establish(&request.uri, &method, &redacted_uri, tracer)
                    .await?;
                tracer.record_connection(ConnectionAcquired {
                    local_addr: established.local_addr,
                    remote_addr: established.remote_addr,
                    reused: false,
                    was_idle: false,
                    idle_time: Duration::ZERO,
                });
                (
                    established.sender,
                    established.local_addr,
                    established.remote_addr,
                )
            }
        };

        let hyper_request =
            build_hyper_request(&request, self.proxy.is_some() && !is_https(&request.uri))?;
        let response = sender.send_request(hyper_request).await.map_err(|source| {
            let kind = classify_hyper_error(&source);
            transport_error(kind, &method, &redacted_uri, source)
        })?;
        tracer.record(TracePhase::FirstByte);

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|source| Error::ReadBody {
                method: method.clone(),
                uri: redacted_uri.clone(),
                source: Box::new(source),
            })?
            .to_bytes();
        tracer.record(TracePhase::End);

        let reusable = !self.disable_keep_alive
            && !connection_close(&request.headers)
            && !connection_close(&parts.headers)
            && !sender.is_closed();
        if reusable {
            self.check_in(
                key,
                IdleConnection {
                    sender,
                    local_addr,
                    remote_addr,
                    idle_since: Instant::now(),
                },
            );
        }

        Ok(EngineResponse {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }
}

async fn spawn_http1<I>(
    io: I,
    method: &Method,
    redacted_uri: &str,
) -> Result<http1::SendRequest<Full<Bytes>>, Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Send + Unpin + 'static,
{
    let (sender, connection) = http1::handshake(io).await.map_err(|source| {
        let kind = classify_hyper_error(&source);
        transport_error(kind, method, redacted_uri, source)
    })?;
    tokio::spawn(async move {
        if let Err(error) = connection.await {
            debug!(error = %error, "http1 connection task ended with error");
        }
    });
    Ok(sender)
}

fn build_hyper_request(
    request: &EngineRequest,
    absolute_form: bool,
) -> Result<Request<Full<Bytes>>, Error> {
    let target = if absolute_form {
        request.uri.to_string()
    } else {
        request
            .uri
            .path_and_query()
            .map(|item| item.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned())
    };

    let mut builder = Request::builder()
        .method(request.method.clone())
        .uri(target);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    builder
        .body(Full::new(request.body.clone()))
        .map_err(|source| Error::RequestBuild { source })
}

/// Ensures the prepared headers carry a Host header matching the target.
pub(crate) fn ensure_host_header(headers: &mut HeaderMap, uri: &Uri) {
    if headers.contains_key(HOST) {
        return;
    }
    let Some(host) = uri.host() else {
        return;
    };
    let authority = match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    if let Ok(value) = HeaderValue::from_str(&authority) {
        headers.insert(HOST, value);
    }
}

fn pool_key(uri: &Uri) -> PoolKey {
    (
        uri.scheme_str().unwrap_or("http").to_ascii_lowercase(),
        uri.host().unwrap_or_default().to_ascii_lowercase(),
        default_port(uri),
    )
}

fn connection_close(headers: &HeaderMap) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .is_ok_and(|text| text.to_ascii_lowercase().contains("close"))
    })
}

fn transport_error(
    kind: TransportErrorKind,
    method: &Method,
    redacted_uri: &str,
    source: impl Into<BoxError>,
) -> Error {
    Error::Transport {
        kind,
        method: method.clone(),
        uri: redacted_uri.to_owned(),
        source: source.into(),
    }
}

fn build_tls_config(danger_accept_invalid_certs: bool) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|source| Error::TlsConfig {
            message: source.to_string(),
        })?;

    if danger_accept_invalid_certs {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
            .with_no_client_auth());
    }

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Ok(builder
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Accepts any server certificate. Installed only when the verification
/// toggle is off; signatures are still checked against the presented chain.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
