use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reqtrace::prelude::{Client, FileSink, RemoteSink};
use serde_json::Value;

struct MockResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl MockResponse {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    fn redirect(location: impl Into<String>) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".to_owned(), location.into())],
            body: String::new(),
        }
    }
}

struct MockServer {
    base_url: String,
    join: Option<JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("read local address");
        listener
            .set_nonblocking(true)
            .expect("set listener nonblocking");

        let join = thread::spawn(move || {
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            let mut response_index = 0;

            while response_index < responses.len() && std::time::Instant::now() < deadline {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = read_request_head(&mut stream);
                        let response = &responses[response_index];
                        response_index += 1;
                        let _ = write_response(&mut stream, response);
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
            join: Some(join),
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
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
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > 64 * 1024 {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

fn write_response(stream: &mut TcpStream, response: &MockResponse) -> std::io::Result<()> {
    let reason = match response.status {
        200 => "OK",
        302 => "Found",
        _ => "Unknown",
    };
    let mut head = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n",
        response.status,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(response.body.as_bytes())?;
    stream.flush()
}

fn start_collector(expected_lines: usize) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind collector");
    let address = listener.local_addr().expect("collector address").to_string();
    let join = thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept collector connection");
        BufReader::new(conn)
            .lines()
            .take(expected_lines)
            .map(|line| line.expect("read collector line"))
            .collect()
    });
    (address, join)
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("reqtrace-it-{}-{name}", std::process::id()))
}

fn split_records(report: &str) -> Vec<String> {
    let separator: String = "=".repeat(104);
    report
        .split(&format!("{separator}\n"))
        .map(str::to_owned)
        .filter(|block| !block.trim().is_empty())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn file_sink_receives_one_parseable_record_per_request() {
    let server = MockServer::start(vec![MockResponse::ok("sink payload")]);
    let path = temp_path("single.txt");
    let sink = Arc::new(FileSink::create(&path).expect("create file sink"));
    let client = Client::builder()
        .event_sink(sink.clone())
        .try_build()
        .expect("build client");

    let url = format!("{}/", server.base_url);
    let response = client.get(url.clone()).send().await.expect("request");
    assert_eq!(response.status(), 200);
    sink.close();

    let written = std::fs::read_to_string(&path).expect("read sink file");
    let records = split_records(&written);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert!(record.starts_with(&format!("Index:{url}\n\n")));
    assert!(record.contains("Request raw:\n\tGET / HTTP/1.1\r\n"));
    assert!(record.contains("Response raw:\n\tHTTP/1.1 200 OK\r\n"));
    assert!(record.contains("sink payload"));
    assert!(!record.contains("Error:"));
    std::fs::remove_file(&path).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_share_one_file_sink_without_interleaving() {
    const REQUESTS: usize = 8;
    let server = MockServer::start((0..REQUESTS).map(|_| MockResponse::ok("ok")).collect());
    let path = temp_path("concurrent.txt");
    let sink = Arc::new(FileSink::create(&path).expect("create file sink"));
    let client = Client::builder()
        .event_sink(sink.clone())
        .try_build()
        .expect("build client");

    let mut tasks = Vec::new();
    for request_number in 0..REQUESTS {
        let task_client = client.clone();
        let url = format!("{}/{request_number}", server.base_url);
        tasks.push(tokio::spawn(async move {
            task_client
                .get(url)
                .index(request_number as i64)
                .send()
                .await
        }));
    }
    for task in tasks {
        task.await.expect("join request task").expect("request");
    }
    sink.close();

    let written = std::fs::read_to_string(&path).expect("read sink file");
    let records = split_records(&written);
    assert_eq!(records.len(), REQUESTS);

    let mut seen_indices: Vec<i64> = Vec::new();
    for record in &records {
        assert_eq!(record.matches("Index:").count(), 1, "interleaved record: {record}");
        assert_eq!(record.matches("Request raw:").count(), 1);
        assert_eq!(record.matches("Response raw:").count(), 1);
        let index_line = record.lines().next().expect("first line");
        let index: i64 = index_line
            .strip_prefix("Index:")
            .expect("record starts with index line")
            .parse()
            .expect("numeric index");
        seen_indices.push(index);
    }
    seen_indices.sort_unstable();
    assert_eq!(seen_indices, (0..REQUESTS as i64).collect::<Vec<_>>());
    std::fs::remove_file(&path).ok();
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_sink_sends_newline_delimited_json_records() {
    let server = MockServer::start(vec![MockResponse::ok("one"), MockResponse::ok("two")]);
    let (collector_addr, collector) = start_collector(2);
    let sink = Arc::new(RemoteSink::connect(&collector_addr).expect("connect remote sink"));
    let client = Client::builder()
        .event_sink(sink.clone())
        .try_build()
        .expect("build client");

    for request_number in 1..=2_i64 {
        client
            .get(format!("{}/", server.base_url))
            .index(request_number)
            .send()
            .await
            .expect("request");
    }
    sink.close();

    let lines = collector.join().expect("join collector");
    assert_eq!(lines.len(), 2);
    for (line, expected_index) in lines.iter().zip(1..=2_i64) {
        let record: Value = serde_json::from_str(line).expect("parse record json");
        assert_eq!(record["index"], expected_index);
        assert_eq!(record["error"], "");
        assert!(record["connectInfo"]["gotConnectTime"].is_string());
        assert!(record["requestRaw"].is_string());
        assert!(record["responseRaw"].is_string());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_redirect_error_reaches_file_sink_but_is_cleared_for_remote() {
    let server = MockServer::start(vec![MockResponse::redirect("http://example.test/next")]);
    let (collector_addr, collector) = start_collector(1);
    let path = temp_path("redirect.txt");
    let file_sink = Arc::new(FileSink::create(&path).expect("create file sink"));
    let remote_sink = Arc::new(RemoteSink::connect(&collector_addr).expect("connect remote sink"));
    let client = Client::builder()
        .event_sink(file_sink.clone())
        .event_sink(remote_sink.clone())
        .try_build()
        .expect("build client");

    let error = client
        .get(format!("{}/", server.base_url))
        .index("probe-1")
        .send()
        .await
        .expect_err("redirect should be rejected");
    assert!(error.to_string().contains("auto redirect is disabled"));
    file_sink.close();
    remote_sink.close();

    let written = std::fs::read_to_string(&path).expect("read sink file");
    assert!(written.contains("Error:auto redirect is disabled"));
    assert!(written.contains("Response raw:\n\tHTTP/1.1 302 Found\r\n"));

    let lines = collector.join().expect("join collector");
    let record: Value = serde_json::from_str(&lines[0]).expect("parse record json");
    assert_eq!(record["error"], "");
    assert_eq!(record["index"], "probe-1");
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_request_event_carries_error_text_and_empty_response() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let address = listener.local_addr().expect("read local address");
    drop(listener);

    let path = temp_path("failure.txt");
    let sink = Arc::new(FileSink::create(&path).expect("create file sink"));
    let client = Client::builder()
        .event_sink(sink.clone())
        .try_build()
        .expect("build client");

    client
        .get(format!("http://{address}/"))
        .send()
        .await
        .expect_err("connect should fail");
    sink.close();

    let written = std::fs::read_to_string(&path).expect("read sink file");
    let records = split_records(&written);
    assert_eq!(records.len(), 1);
    assert!(records[0].contains("Error:http transport error (connect)"));
    assert!(records[0].contains("Request raw:\n\tGET / HTTP/1.1\r\n"));
    assert!(records[0].contains("Response raw:\n\t\n"));
    std::fs::remove_file(&path).ok();
}
