//! Bulk payload movement.
//!
//! The client side pushes [`CHUNK_SIZE`] byte chunks until a [`SendLimit`]
//! is reached, optionally restarting the loop at every interval boundary.
//! The server side drains the stream until the `BYE` sentinel shows up.
//! Both sides work on any `AsyncRead`/`AsyncWrite`, so they run unchanged
//! over a `TcpStream` or an in-memory duplex pipe.

use crate::config::StopCondition;
use crate::protocol::{epoch_seconds, SentinelScanner, BYE, CHUNK_SIZE, PAYLOAD_CHUNK};
use crate::Result;
use log::debug;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bound on a single run of the send loop.
///
/// The loop stops before the next chunk once the deadline has passed or
/// the byte budget has been met. A limit with neither bound sends nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendLimit {
    pub deadline: Option<Instant>,
    pub byte_budget: Option<u64>,
}

impl SendLimit {
    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            byte_budget: None,
        }
    }

    pub fn bytes(budget: u64) -> Self {
        Self {
            deadline: None,
            byte_budget: Some(budget),
        }
    }

    /// Whether the loop should stop after `sent` bytes.
    pub fn reached(&self, sent: u64) -> bool {
        let timed_out = self.deadline.map(|d| Instant::now() >= d);
        let budget_met = self.byte_budget.map(|b| sent >= b);
        match (timed_out, budget_met) {
            (None, None) => true,
            (t, b) => t.unwrap_or(false) || b.unwrap_or(false),
        }
    }
}

/// Sends payload chunks until `limit` is reached and returns the bytes sent.
///
/// The result is always a multiple of [`CHUNK_SIZE`]. With a byte budget
/// the overshoot is below one chunk.
pub async fn send_bulk<W: AsyncWrite + Unpin>(writer: &mut W, limit: SendLimit) -> Result<u64> {
    let mut sent = 0u64;
    while !limit.reached(sent) {
        writer.write_all(&PAYLOAD_CHUNK).await?;
        sent += CHUNK_SIZE as u64;
    }
    writer.flush().await?;
    Ok(sent)
}

/// Checkpoint taken at the end of one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSample {
    /// Zero-based interval number
    pub index: usize,
    /// Bytes sent during this interval only
    pub bytes: u64,
    /// Time spent sending during this interval
    pub elapsed: Duration,
}

/// Totals of a send run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SendSummary {
    pub bytes_sent: u64,
    /// From the first chunk to the end of the last chunk
    pub elapsed: Duration,
}

/// Sends payload in `interval`-long slices until `stop` is satisfied.
///
/// Each slice runs until `min(slice_start + interval, total_stop)` or until
/// the remaining byte budget is met, after which `on_sample` receives the
/// slice's checkpoint and the per-slice counter is reset. Samples are
/// emitted in order, and their byte counts sum to the returned total.
pub async fn send_intervals<W, F>(
    writer: &mut W,
    stop: StopCondition,
    interval: Duration,
    mut on_sample: F,
) -> Result<SendSummary>
where
    W: AsyncWrite + Unpin,
    F: FnMut(&IntervalSample),
{
    let session_start = Instant::now();
    let (total_deadline, byte_target) = match stop {
        StopCondition::Time(duration) => (Some(session_start + duration), None),
        StopCondition::Bytes(bytes) => (None, Some(bytes)),
    };

    let mut total = 0u64;
    let mut index = 0usize;
    loop {
        let slice_start = Instant::now();
        let mut deadline = slice_start + interval;
        if let Some(total_deadline) = total_deadline {
            deadline = deadline.min(total_deadline);
        }
        let limit = SendLimit {
            deadline: Some(deadline),
            byte_budget: byte_target.map(|target| target.saturating_sub(total)),
        };

        let bytes = send_bulk(writer, limit).await?;
        let checkpoint = Instant::now();
        total += bytes;

        let sample = IntervalSample {
            index,
            bytes,
            elapsed: checkpoint - slice_start,
        };
        debug!(
            "interval {} done: {} bytes in {:.3}s",
            index,
            bytes,
            sample.elapsed.as_secs_f64()
        );
        on_sample(&sample);
        index += 1;

        let time_done = total_deadline.map_or(false, |d| checkpoint >= d);
        let bytes_done = byte_target.map_or(false, |target| total >= target);
        if time_done || bytes_done {
            return Ok(SendSummary {
                bytes_sent: total,
                elapsed: checkpoint - session_start,
            });
        }
    }
}

/// What the receive loop observed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiveOutcome {
    /// Payload bytes, excluding the sentinel
    pub bytes_received: u64,
    /// Wall clock when `BYE` was seen, in epoch seconds
    pub stopped_at: f64,
    /// Monotonic instant when `BYE` was seen
    pub stopped_instant: Instant,
}

/// Drains payload until the `BYE` sentinel arrives.
///
/// # Errors
///
/// End of stream before `BYE` is returned as an `UnexpectedEof` I/O error;
/// any read error is passed through unchanged.
pub async fn recv_bulk<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ReceiveOutcome> {
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut scanner = SentinelScanner::new(BYE);

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "connection closed after {} bytes without BYE",
                    scanner.consumed()
                ),
            )
            .into());
        }

        if let Some(offset) = scanner.feed(&buffer[..n]) {
            return Ok(ReceiveOutcome {
                bytes_received: offset,
                stopped_at: epoch_seconds(),
                stopped_instant: Instant::now(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::write_bye;

    /// Spawns a task that drains `reader` and returns the byte count.
    fn drain<R: AsyncRead + Unpin + Send + 'static>(mut reader: R) -> tokio::task::JoinHandle<u64> {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            let mut total = 0u64;
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n as u64,
                }
            }
            total
        })
    }

    #[test]
    fn test_send_limit_reached() {
        assert!(SendLimit::default().reached(0));
        assert!(!SendLimit::bytes(1000).reached(0));
        assert!(SendLimit::bytes(1000).reached(1000));

        let past = Instant::now();
        assert!(SendLimit::until(past).reached(0));

        let future = Instant::now() + Duration::from_secs(60);
        assert!(!SendLimit::until(future).reached(0));

        let both = SendLimit {
            deadline: Some(future),
            byte_budget: Some(500),
        };
        assert!(both.reached(1000));
    }

    #[tokio::test]
    async fn test_send_bulk_byte_budget() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let reader = drain(server);

        let sent = send_bulk(&mut client, SendLimit::bytes(10_500)).await.unwrap();
        assert_eq!(sent, 11_000);
        drop(client);

        assert_eq!(reader.await.unwrap(), 11_000);
    }

    #[tokio::test]
    async fn test_send_bulk_exact_budget() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let reader = drain(server);

        let sent = send_bulk(&mut client, SendLimit::bytes(5_000)).await.unwrap();
        assert_eq!(sent, 5_000);
        drop(client);
        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_bulk_deadline_multiple_of_chunk() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let reader = drain(server);

        let deadline = Instant::now() + Duration::from_millis(100);
        let sent = send_bulk(&mut client, SendLimit::until(deadline)).await.unwrap();
        assert!(Instant::now() >= deadline);
        assert_eq!(sent % CHUNK_SIZE as u64, 0);
        drop(client);

        assert_eq!(reader.await.unwrap(), sent);
    }

    #[tokio::test]
    async fn test_send_intervals_sum_matches_total() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let reader = drain(server);

        let mut samples = Vec::new();
        let summary = send_intervals(
            &mut client,
            StopCondition::Time(Duration::from_millis(300)),
            Duration::from_millis(100),
            |s| samples.push(*s),
        )
        .await
        .unwrap();
        drop(client);

        assert_eq!(samples.len(), 3);
        let indices: Vec<usize> = samples.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);

        let sum: u64 = samples.iter().map(|s| s.bytes).sum();
        assert_eq!(sum, summary.bytes_sent);
        assert_eq!(reader.await.unwrap(), summary.bytes_sent);

        let elapsed_sum: Duration = samples.iter().map(|s| s.elapsed).sum();
        assert!(elapsed_sum <= summary.elapsed);
    }

    #[tokio::test]
    async fn test_send_intervals_uneven_last_slice() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let reader = drain(server);

        let mut samples = Vec::new();
        send_intervals(
            &mut client,
            StopCondition::Time(Duration::from_millis(250)),
            Duration::from_millis(100),
            |s| samples.push(*s),
        )
        .await
        .unwrap();
        drop(client);
        reader.await.unwrap();

        assert_eq!(samples.len(), 3);
        assert!(samples[2].elapsed < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_send_intervals_byte_mode() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let reader = drain(server);

        let mut samples = Vec::new();
        let summary = send_intervals(
            &mut client,
            StopCondition::Bytes(25_500),
            Duration::from_secs(5),
            |s| samples.push(*s),
        )
        .await
        .unwrap();
        drop(client);
        reader.await.unwrap();

        assert_eq!(summary.bytes_sent, 26_000);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].bytes, 26_000);
    }

    #[tokio::test]
    async fn test_recv_bulk_excludes_sentinel() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let writer = tokio::spawn(async move {
            let sent = send_bulk(&mut client, SendLimit::bytes(7_000)).await.unwrap();
            write_bye(&mut client).await.unwrap();
            (sent, client)
        });

        let outcome = recv_bulk(&mut server).await.unwrap();
        let (sent, _client) = writer.await.unwrap();
        assert_eq!(outcome.bytes_received, sent);
        assert!(outcome.stopped_at > 0.0);
    }

    #[tokio::test]
    async fn test_recv_bulk_sentinel_in_same_write() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        // payload and BYE coalesced into a single write
        let mut data = vec![0u8; 2_500];
        data.extend_from_slice(BYE);
        client.write_all(&data).await.unwrap();

        let outcome = recv_bulk(&mut server).await.unwrap();
        assert_eq!(outcome.bytes_received, 2_500);
    }

    #[tokio::test]
    async fn test_recv_bulk_eof_without_bye() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&PAYLOAD_CHUNK).await.unwrap();
        drop(client);

        match recv_bulk(&mut server).await {
            Err(crate::Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }
}
