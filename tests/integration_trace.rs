use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqtrace::prelude::{Client, ErrorCode, RetryPolicy};
use tokio_util::sync::CancellationToken;

struct MockResponse {
    status: u16,
    body: String,
    delay: Duration,
}

impl MockResponse {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    fn delayed(body: impl Into<String>, delay: Duration) -> Self {
        Self {
            status: 200,
            body: body.into(),
            delay,
        }
    }
}

/// One accepted connection per configured response, in order.
struct MockServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let served = Arc::new(AtomicUsize::new(0));
        let served_clone = Arc::clone(&served);

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = read_request_head(&mut stream);
                        served_clone.fetch_add(1, Ordering::SeqCst);
                        let response = &responses[response_index];
                        response_index += 1;

                        if !response.delay.is_zero() {
                            thread::sleep(response.delay);
                        }
                        let _ = write_response(
                            &mut stream,
                            response.status,
                            &[("Connection", "close")],
                            &response.body,
                        );
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            join: Some(join),
        }
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    fn wait_until_done(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.wait_until_done();
    }
}

/// Serves several requests over a single accepted connection.
struct KeepAliveServer {
    base_url: String,
    connections: Arc<AtomicUsize>,
    join: Option<JoinHandle<()>>,
}

impl KeepAliveServer {
    fn start(max_requests: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind keep-alive server");
        let address = listener.local_addr().expect("read local address");

        let connections = Arc::new(AtomicUsize::new(0));
        let connections_clone = Arc::clone(&connections);

        let join = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            connections_clone.fetch_add(1, Ordering::SeqCst);
            for _ in 0..max_requests {
                if read_request_head(&mut stream).is_err() {
                    break;
                }
                if write_response(&mut stream, 200, &[], "keep-alive response").is_err() {
                    break;
                }
            }
        });

        Self {
            base_url: format!("http://{address}"),
            connections,
            join: Some(join),
        }
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAliveServer {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Accepts one connection, reports that the request arrived, then holds the
/// response until released (or until the hold times out).
struct GatedServer {
    base_url: String,
    served: Arc<AtomicUsize>,
    started: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl GatedServer {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind gated server");
        let address = listener.local_addr().expect("read local address");

        let served = Arc::new(AtomicUsize::new(0));
        let served_clone = Arc::clone(&served);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let join = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let _ = read_request_head(&mut stream);
            served_clone.fetch_add(1, Ordering::SeqCst);
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            let _ = write_response(&mut stream, 200, &[("Connection", "close")], "late response");
        });

        Self {
            base_url: format!("http://{address}"),
            served,
            started: started_rx,
            release: release_tx,
            join: Some(join),
        }
    }

    fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Drop for GatedServer {
    fn drop(&mut self) {
        let _ = self.release.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn read_request_head(stream: &mut TcpStream) -> std::io::Result<String> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk)?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before request head",
            ));
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > 64 * 1024 {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(&str, &str)],
    body: &str,
) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        302 => "Found",
        _ => "Unknown",
    };
    let mut head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\n",
        body.len()
    );
    for (name, value) in headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(body.as_bytes())?;
    stream.flush()
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_request_records_ordered_connect_timestamps() {
    let server = MockServer::start(vec![MockResponse::ok("hello trace")]);
    let client = Client::builder().try_build().expect("build client");

    let response = client
        .get(format!("{}/", server.base_url))
        .send()
        .await
        .expect("request should succeed");

    assert_eq!(response.status(), 200);
    assert_eq!(response.text_lossy(), "hello trace");

    let info = response.connect_info();
    let get = info.get_connect_time.expect("get_connect_time");
    let got = info.got_connect_time.expect("got_connect_time");
    let first = info.receive_response_time.expect("receive_response_time");
    let done = info.connect_done.expect("connect_done");
    assert!(get <= got && got <= first && first <= done);
    assert!(info.remote_addr.is_some());
    assert!(info.local_addr.is_some());

    let timing = response.trace_info();
    assert_eq!(timing.request_attempt, 1);
    assert!(!timing.is_conn_reused);
    assert!(timing.total_time >= timing.server_time);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_request_reuses_pooled_connection_with_zero_setup_durations() {
    let server = KeepAliveServer::start(2);
    let client = Client::builder().try_build().expect("build client");

    let first = client
        .get(format!("{}/a", server.base_url))
        .send()
        .await
        .expect("first request");
    assert!(!first.trace_info().is_conn_reused);

    // Give the connection task a moment to settle back into the idle pool.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = client
        .get(format!("{}/b", server.base_url))
        .send()
        .await
        .expect("second request");

    let timing = second.trace_info();
    assert!(timing.is_conn_reused);
    assert!(timing.is_conn_was_idle);
    assert_eq!(timing.dns_lookup, Duration::ZERO);
    assert_eq!(timing.tcp_conn_time, Duration::ZERO);
    assert_eq!(timing.tls_handshake, Duration::ZERO);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_server_exhausts_all_attempts_and_reports_retries_exhausted() {
    let delay = Duration::from_millis(500);
    let mut server = MockServer::start(vec![
        MockResponse::delayed("late", delay),
        MockResponse::delayed("late", delay),
        MockResponse::delayed("late", delay),
    ]);
    let client = Client::builder()
        .request_timeout(Duration::from_millis(150))
        .retry_policy(
            RetryPolicy::standard()
                .max_attempts(3)
                .base_backoff(Duration::from_millis(10))
                .max_backoff(Duration::from_millis(20)),
        )
        .try_build()
        .expect("build client");

    let error = client
        .get(format!("{}/", server.base_url))
        .send()
        .await
        .expect_err("request should exhaust retries");

    assert_eq!(error.code(), ErrorCode::RetriesExhausted);
    assert!(error.to_string().contains("after 3 attempts"));

    server.wait_until_done();
    assert_eq!(server.served_count(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_mid_request_stops_after_exactly_one_attempt() {
    let server = GatedServer::start();
    let client = Client::builder()
        .request_timeout(Duration::from_secs(3))
        .retry_policy(RetryPolicy::standard().max_attempts(3))
        .try_build()
        .expect("build client");

    let cancel = CancellationToken::new();
    let url = format!("{}/", server.base_url);
    let request_client = client.clone();
    let request_cancel = cancel.clone();
    let request = tokio::spawn(async move {
        request_client
            .get(url)
            .cancellation_token(request_cancel)
            .send()
            .await
    });

    let started = server.started.recv_timeout(Duration::from_secs(2));
    assert!(started.is_ok(), "server never saw the request");
    cancel.cancel();

    let error = request
        .await
        .expect("join request task")
        .expect_err("request should be canceled");
    assert_eq!(error.code(), ErrorCode::Canceled);
    assert!(error.is_canceled());
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_before_dispatch_prevents_any_attempt() {
    let mut server = MockServer::start(vec![]);
    let client = Client::builder()
        .retry_policy(RetryPolicy::standard().max_attempts(3))
        .try_build()
        .expect("build client");

    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = client
        .get(format!("{}/", server.base_url))
        .cancellation_token(cancel)
        .send()
        .await
        .expect_err("request should be canceled");

    assert!(error.is_canceled());
    server.wait_until_done();
    assert_eq!(server.served_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_failure_to_closed_port_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let address = listener.local_addr().expect("read local address");
    drop(listener);

    let client = Client::builder().try_build().expect("build client");
    let error = client
        .get(format!("http://{address}/"))
        .send()
        .await
        .expect_err("connect should fail");

    match error {
        reqtrace::Error::Transport { kind, .. } => {
            assert_eq!(kind, reqtrace::TransportErrorKind::Connect);
        }
        other => panic!("unexpected error variant: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn per_request_timeout_overrides_client_default() {
    let mut server = MockServer::start(vec![MockResponse::delayed(
        "late",
        Duration::from_millis(400),
    )]);
    let client = Client::builder()
        .request_timeout(Duration::from_secs(5))
        .try_build()
        .expect("build client");

    let error = client
        .get(format!("{}/", server.base_url))
        .timeout(Duration::from_millis(100))
        .send()
        .await
        .expect_err("request should time out");

    assert_eq!(error.code(), ErrorCode::Timeout);
    server.wait_until_done();
}
