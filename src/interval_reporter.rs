//! Channel-backed reporting for rows produced by concurrent sessions.
//!
//! Sessions hold a cloned [`Reporter`] and push rows without blocking the
//! data path. A single task drains the channel and forwards each row to the
//! real sink, so the sink sees one row at a time and rows of any given
//! session keep their original order.

use crate::measurements::{ReportSink, TransferResult};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message sent to the reporter task.
#[derive(Debug, Clone)]
pub enum ReportMessage {
    /// A finished row
    Row(TransferResult),
    /// No more rows will follow
    Complete,
}

/// Handle for sending rows to the reporter task.
///
/// # Examples
///
/// ```
/// use simpleperf::interval_reporter::{run_reporter_task, Reporter};
/// use simpleperf::measurements::{CollectingSink, ReportSink, RowKind, TransferResult};
/// use simpleperf::DisplayUnit;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let (reporter, receiver) = Reporter::new();
///     let sink = CollectingSink::new();
///     let task = tokio::spawn(run_reporter_task(receiver, Arc::new(sink.clone())));
///
///     let row = TransferResult::new(
///         "127.0.0.1:8088".parse().unwrap(),
///         0.0, 1.0, 1.0, 1000, DisplayUnit::Bytes, RowKind::Total,
///     );
///     reporter.on_row(&row);
///     reporter.complete();
///     task.await.unwrap();
///
///     assert_eq!(sink.rows().len(), 1);
/// }
/// ```
#[derive(Clone)]
pub struct Reporter {
    sender: mpsc::UnboundedSender<ReportMessage>,
}

impl Reporter {
    /// Creates a reporter and the receiver its task should drain.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Signals that no further rows will be sent.
    pub fn complete(&self) {
        let _ = self.sender.send(ReportMessage::Complete);
    }
}

impl ReportSink for Reporter {
    fn on_row(&self, row: &TransferResult) {
        // a closed channel means the reporter task is gone; nothing to do
        let _ = self.sender.send(ReportMessage::Row(row.clone()));
    }
}

/// Forwards rows to `sink` until `Complete` arrives or every sender is
/// dropped.
pub async fn run_reporter_task(
    mut receiver: mpsc::UnboundedReceiver<ReportMessage>,
    sink: Arc<dyn ReportSink>,
) {
    while let Some(msg) = receiver.recv().await {
        match msg {
            ReportMessage::Row(row) => sink.on_row(&row),
            ReportMessage::Complete => break,
        }
    }
}
