use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

/// Connection-lifecycle phase boundaries reported by the transport.
///
/// The set is closed: every timestamp the tracer can record corresponds to
/// exactly one variant. Address and reuse metadata travel separately through
/// [`ConnectionAcquired`] because they carry payload beyond a point in time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracePhase {
    /// The client starts looking for a usable connection.
    GetConn,
    DnsStart,
    DnsDone,
    ConnectStart,
    ConnectDone,
    TlsStart,
    TlsDone,
    /// The first byte of the response arrived.
    FirstByte,
    /// The response is fully received and the connection released.
    End,
}

/// Metadata captured when a usable connection is handed to the request.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionAcquired {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub reused: bool,
    pub was_idle: bool,
    pub idle_time: Duration,
}

/// Records one attempt's lifecycle timestamps.
///
/// A tracer is created fresh for each attempt and owned exclusively by it;
/// phases are recorded sequentially by the single execution driving the
/// attempt, so no locking is involved. Wall-clock values are derived from a
/// single base pair taken at construction, which keeps the reported
/// timestamps monotonically non-decreasing in phase order.
#[derive(Debug)]
pub struct ConnectionTracer {
    base_instant: Instant,
    base_wall: DateTime<Utc>,
    get_conn: Option<Instant>,
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    connect_start: Option<Instant>,
    connect_done: Option<Instant>,
    tls_start: Option<Instant>,
    tls_done: Option<Instant>,
    got_conn: Option<Instant>,
    first_byte: Option<Instant>,
    end: Option<Instant>,
    connection: Option<ConnectionAcquired>,
}

impl ConnectionTracer {
    pub fn start() -> Self {
        Self {
            base_instant: Instant::now(),
            base_wall: Utc::now(),
            get_conn: None,
            dns_start: None,
            dns_done: None,
            connect_start: None,
            connect_done: None,
            tls_start: None,
            tls_done: None,
            got_conn: None,
            first_byte: None,
            end: None,
            connection: None,
        }
    }

    /// Records `now()` for the given phase. Must not block; a call is a
    /// single field store.
    pub fn record(&mut self, phase: TracePhase) {
        let now = Instant::now();
        match phase {
            TracePhase::GetConn => self.get_conn = Some(now),
            TracePhase::DnsStart => self.dns_start = Some(now),
            TracePhase::DnsDone => self.dns_done = Some(now),
            TracePhase::ConnectStart => {
                // DNS may be skipped entirely (literal IP target). Default the
                // DNS pair to the connect start so derived durations are zero
                // rather than negative or missing.
                if self.dns_done.is_none() {
                    self.dns_done = Some(now);
                }
                if self.dns_start.is_none() {
                    self.dns_start = self.dns_done;
                }
                self.connect_start = Some(now);
            }
            TracePhase::ConnectDone => self.connect_done = Some(now),
            TracePhase::TlsStart => self.tls_start = Some(now),
            TracePhase::TlsDone => self.tls_done = Some(now),
            TracePhase::FirstByte => self.first_byte = Some(now),
            TracePhase::End => self.end = Some(now),
        }
    }

    /// Records the connection-acquired phase together with its metadata.
    pub fn record_connection(&mut self, connection: ConnectionAcquired) {
        self.got_conn = Some(Instant::now());
        self.connection = Some(connection);
    }

    fn wall(&self, instant: Option<Instant>) -> Option<DateTime<Utc>> {
        let instant = instant?;
        let delta = TimeDelta::from_std(instant.duration_since(self.base_instant))
            .unwrap_or(TimeDelta::zero());
        self.base_wall.checked_add_signed(delta)
    }

    fn reused(&self) -> bool {
        self.connection.is_some_and(|connection| connection.reused)
    }

    /// Materializes the four-timestamp connection summary for this attempt.
    pub fn connect_info(&self) -> ConnectInfo {
        let connection = self.connection.unwrap_or_default();
        ConnectInfo {
            get_connect_time: self.wall(self.get_conn),
            got_connect_time: self.wall(self.got_conn),
            receive_response_time: self.wall(self.first_byte),
            connect_done: self.wall(self.end),
            remote_addr: connection.remote_addr,
            local_addr: connection.local_addr,
        }
    }

    /// Derives phase durations for this attempt. `attempt` is the 1-based
    /// attempt counter of the surrounding request execution.
    pub fn trace_info(&self, attempt: usize) -> TraceInfo {
        let reused = self.reused();
        let connection = self.connection.unwrap_or_default();
        let total_base = if reused { self.get_conn } else { self.dns_start.or(self.get_conn) };
        TraceInfo {
            dns_lookup: duration_between(self.dns_start, self.dns_done),
            conn_time: duration_between(self.get_conn, self.got_conn),
            tcp_conn_time: duration_between(self.dns_done, self.connect_done),
            tls_handshake: duration_between(self.tls_start, self.tls_done),
            server_time: duration_between(self.got_conn, self.first_byte),
            response_time: duration_between(self.first_byte, self.end),
            total_time: duration_between(total_base, self.end),
            is_conn_reused: reused,
            is_conn_was_idle: connection.was_idle,
            conn_idle_time: connection.idle_time,
            request_attempt: attempt,
            remote_addr: connection.remote_addr,
        }
    }
}

fn duration_between(start: Option<Instant>, end: Option<Instant>) -> Duration {
    match (start, end) {
        (Some(start), Some(end)) => end.saturating_duration_since(start),
        _ => Duration::ZERO,
    }
}

/// Wall-clock summary of one attempt's connection lifecycle.
///
/// Timestamps are `None` when the corresponding phase never occurred (for
/// example a request that failed before any response byte arrived). When all
/// are populated they are non-decreasing in field order.
#[derive(Clone, Copy, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    /// When the client began seeking a connection.
    pub get_connect_time: Option<DateTime<Utc>>,
    /// When a usable connection was obtained; also when transmission began.
    pub got_connect_time: Option<DateTime<Utc>>,
    /// When the first response byte arrived.
    #[serde(rename = "receiveHttpResponseTime")]
    pub receive_response_time: Option<DateTime<Utc>>,
    /// When the connection was released.
    pub connect_done: Option<DateTime<Utc>>,
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

/// Durations derived from one attempt's recorded phases.
///
/// For a reused pooled connection the DNS, TCP and TLS durations are zero and
/// `is_conn_reused` is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceInfo {
    pub dns_lookup: Duration,
    /// Time to obtain a usable connection, pooled or fresh.
    pub conn_time: Duration,
    pub tcp_conn_time: Duration,
    pub tls_handshake: Duration,
    /// Time the server took to produce the first response byte.
    pub server_time: Duration,
    /// Time from first response byte to request completion.
    pub response_time: Duration,
    pub total_time: Duration,
    pub is_conn_reused: bool,
    pub is_conn_was_idle: bool,
    pub conn_idle_time: Duration,
    /// 1-based attempt counter, incremented on each retry.
    pub request_attempt: usize,
    pub remote_addr: Option<SocketAddr>,
}
