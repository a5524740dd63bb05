use crate::config::{DisplayUnit, Role};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Column width used by the table renderer.
pub const COLUMN_WIDTH: usize = 20;

/// Whether a row covers one interval or the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    Interval,
    Total,
}

/// One reported measurement.
///
/// Produced by a session coordinator, either per reporting interval or once
/// for the whole session, and never modified afterwards.
///
/// # Examples
///
/// ```
/// use simpleperf::{DisplayUnit, RowKind, TransferResult};
///
/// let row = TransferResult::new(
///     "127.0.0.1:8088".parse().unwrap(),
///     0.0,
///     3.0,
///     3.0,
///     150_000_000,
///     DisplayUnit::Megabytes,
///     RowKind::Total,
/// );
/// assert_eq!(row.formatted_volume, "150 MB");
/// assert!((row.rate_mbps - 400.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    pub peer_address: IpAddr,
    pub peer_port: u16,
    /// Window start, seconds from session start
    pub interval_start: f64,
    /// Window end, seconds from session start
    pub interval_end: f64,
    /// Measured time the bytes took to move
    pub elapsed_seconds: f64,
    pub bytes_moved: u64,
    pub formatted_volume: String,
    pub rate_mbps: f64,
    pub kind: RowKind,
}

impl TransferResult {
    pub fn new(
        peer: SocketAddr,
        interval_start: f64,
        interval_end: f64,
        elapsed_seconds: f64,
        bytes_moved: u64,
        unit: DisplayUnit,
        kind: RowKind,
    ) -> Self {
        Self {
            peer_address: peer.ip(),
            peer_port: peer.port(),
            interval_start,
            interval_end,
            elapsed_seconds,
            bytes_moved,
            formatted_volume: format_volume(bytes_moved, unit),
            rate_mbps: rate_mbps(bytes_moved, elapsed_seconds),
            kind,
        }
    }

    /// `ip:port` of the peer, as shown in the ID column.
    pub fn peer_id(&self) -> String {
        SocketAddr::new(self.peer_address, self.peer_port).to_string()
    }

    pub fn is_total(&self) -> bool {
        self.kind == RowKind::Total
    }
}

/// Throughput in megabits per second. Zero when no time has elapsed.
pub fn rate_mbps(bytes: u64, elapsed_seconds: f64) -> f64 {
    if elapsed_seconds > 0.0 {
        bytes as f64 * 8.0 / elapsed_seconds / 1_000_000.0
    } else {
        0.0
    }
}

/// Renders a byte count in `unit`, rounded to a whole number.
pub fn format_volume(bytes: u64, unit: DisplayUnit) -> String {
    let value = (bytes as f64 / unit.bytes() as f64).round();
    format!("{} {}", value as u64, unit)
}

/// Rows produced by one session, in the order they were reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub rows: Vec<TransferResult>,
}

impl SessionReport {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            rows: Vec::new(),
        }
    }

    /// The whole-session row, if the session got that far.
    pub fn total(&self) -> Option<&TransferResult> {
        self.rows.iter().rev().find(|r| r.is_total())
    }

    pub fn intervals(&self) -> impl Iterator<Item = &TransferResult> {
        self.rows.iter().filter(|r| !r.is_total())
    }
}

/// Destination for result rows.
///
/// Sessions on different tasks report into the same sink concurrently, so
/// implementations must be `Send + Sync`. Rows from one session arrive in
/// the order that session produced them.
///
/// Implemented for any `Fn(&TransferResult)` closure.
pub trait ReportSink: Send + Sync {
    fn on_row(&self, row: &TransferResult);
}

impl<F> ReportSink for F
where
    F: Fn(&TransferResult) + Send + Sync,
{
    fn on_row(&self, row: &TransferResult) {
        self(row)
    }
}

/// Sink that drops every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn on_row(&self, _row: &TransferResult) {}
}

/// Thread-safe sink that keeps every row in memory.
///
/// # Examples
///
/// ```
/// use simpleperf::measurements::{CollectingSink, ReportSink, RowKind, TransferResult};
/// use simpleperf::DisplayUnit;
///
/// let sink = CollectingSink::new();
/// let row = TransferResult::new(
///     "127.0.0.1:9000".parse().unwrap(),
///     0.0, 1.0, 1.0, 1000, DisplayUnit::Bytes, RowKind::Total,
/// );
/// sink.on_row(&row);
/// assert_eq!(sink.rows().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    inner: Arc<Mutex<Vec<TransferResult>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows collected so far.
    pub fn rows(&self) -> Vec<TransferResult> {
        self.inner.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl ReportSink for CollectingSink {
    fn on_row(&self, row: &TransferResult) {
        self.inner.lock().push(row.clone());
    }
}

/// Table header for the given role.
pub fn render_header(role: Role) -> String {
    let columns = match role {
        Role::Server => ["ID", "Interval", "Received", "Rate"],
        Role::Client => ["ID", "Interval", "Transfer", "Bandwidth"],
    };
    render_columns(&columns)
}

/// One table line for a row, four right-aligned columns.
///
/// ```
/// use simpleperf::measurements::{render_row, RowKind, TransferResult};
/// use simpleperf::DisplayUnit;
///
/// let row = TransferResult::new(
///     "127.0.0.1:8088".parse().unwrap(),
///     0.0, 2.0, 2.0, 2_000_000, DisplayUnit::Kilobytes, RowKind::Total,
/// );
/// let line = render_row(&row);
/// assert!(line.contains("0.0 - 2.0"));
/// assert!(line.contains("2000 KB"));
/// assert!(line.ends_with("8.00 Mbps"));
/// ```
pub fn render_row(row: &TransferResult) -> String {
    render_columns(&[
        row.peer_id().as_str(),
        format!("{:.1} - {:.1}", row.interval_start, row.interval_end).as_str(),
        row.formatted_volume.as_str(),
        format!("{:.2} Mbps", row.rate_mbps).as_str(),
    ])
}

/// Dashed line printed between interval rows and their total.
pub fn render_separator() -> String {
    "-".repeat(COLUMN_WIDTH * 4 + 3)
}

fn render_columns(columns: &[&str; 4]) -> String {
    format!(
        "{:>w$} {:>w$} {:>w$} {:>w$}",
        columns[0],
        columns[1],
        columns[2],
        columns[3],
        w = COLUMN_WIDTH
    )
}
