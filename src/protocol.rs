//! Fixed-width framing for the control values exchanged around a transfer.
//!
//! Every control value travels in a field of known width, right-padded with
//! the [`FILLER`] byte. A receiver therefore always knows how many bytes to
//! wait for, and a short TCP read can never yield a truncated value.
//!
//! # Wire layout
//!
//! ```text
//! client -> server   duration (8) | start time (32) | mode (3) | payload ... | BYE
//! server -> client   ACK: BYE
//! ```
//!
//! Sentinels (`BYE`, `ACK`) are located by substring search inside a
//! bounded window, so they are found even when TCP coalesces them with
//! payload or splits them across reads.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of one bulk payload chunk in bytes.
pub const CHUNK_SIZE: usize = 1000;

/// Padding byte for fixed-width fields.
pub const FILLER: u8 = 0x00;

/// Width of the declared duration field.
pub const DURATION_WIDTH: usize = 8;

/// Width of the client start time field.
pub const START_TIME_WIDTH: usize = 32;

/// Width of the transfer mode field.
pub const MODE_WIDTH: usize = 3;

/// Total encoded handshake length.
pub const HANDSHAKE_LEN: usize = DURATION_WIDTH + START_TIME_WIDTH + MODE_WIDTH;

/// Largest duration that fits in the duration field.
pub const MAX_DURATION_SECS: i64 = 99_999_999;

/// Sent by the client once the payload is complete.
pub const BYE: &[u8] = b"BYE";

/// Substring the client looks for in the server's reply.
pub const ACK: &[u8] = b"ACK";

/// Fixed acknowledgment token written by the server.
pub const ACK_TOKEN: &[u8; 8] = b"ACK: BYE";

/// Mode field content in byte-count mode.
pub const NUM_TOKEN: &[u8; MODE_WIDTH] = b"NUM";

/// Upper bound on bytes read while searching for the acknowledgment.
pub const SENTINEL_WINDOW: usize = 64;

/// Payload chunk. All zero bytes, so it can never contain a sentinel.
pub static PAYLOAD_CHUNK: [u8; CHUNK_SIZE] = [0u8; CHUNK_SIZE];

/// Errors raised while decoding control values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FramingError {
    #[error("short {field} field: expected {expected} bytes, got {actual}")]
    Short {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} field is not numeric: {value:?}")]
    NonNumeric { field: &'static str, value: String },

    #[error("unexpected terminator inside {field} field")]
    UnexpectedTerminator { field: &'static str },

    #[error("{field} value {value} does not fit in {width} bytes")]
    TooWide {
        field: &'static str,
        value: String,
        width: usize,
    },

    #[error("unknown transfer mode token {0:?}")]
    UnknownMode(String),

    #[error("{0} sentinel not found")]
    MissingSentinel(&'static str),
}

/// How the client decides when to stop sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Stop after the declared duration
    Time,
    /// Stop after a byte target has been reached
    Bytes,
}

/// Control values sent by the client before the payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlHandshake {
    /// Duration the client intends to send for, in seconds
    pub declared_duration: i64,
    /// Client wall clock at transfer start, in epoch seconds
    pub client_start_time: f64,
    pub mode: TransferMode,
}

impl ControlHandshake {
    pub fn new(declared_duration: i64, client_start_time: f64, mode: TransferMode) -> Self {
        Self {
            declared_duration,
            client_start_time,
            mode,
        }
    }

    /// Encodes the handshake into its fixed [`HANDSHAKE_LEN`] byte form.
    ///
    /// # Examples
    ///
    /// ```
    /// use simpleperf::protocol::{ControlHandshake, TransferMode, HANDSHAKE_LEN};
    ///
    /// let hs = ControlHandshake::new(25, 1_700_000_000.25, TransferMode::Bytes);
    /// let bytes = hs.encode().unwrap();
    /// assert_eq!(bytes.len(), HANDSHAKE_LEN);
    ///
    /// let decoded = ControlHandshake::decode(&bytes).unwrap();
    /// assert_eq!(decoded.declared_duration, 25);
    /// assert_eq!(decoded.mode, TransferMode::Bytes);
    /// ```
    pub fn encode(&self) -> Result<[u8; HANDSHAKE_LEN], FramingError> {
        let mut out = [FILLER; HANDSHAKE_LEN];
        out[..DURATION_WIDTH].copy_from_slice(&encode_duration(self.declared_duration)?);
        out[DURATION_WIDTH..DURATION_WIDTH + START_TIME_WIDTH]
            .copy_from_slice(&encode_start_time(self.client_start_time)?);
        out[DURATION_WIDTH + START_TIME_WIDTH..].copy_from_slice(&encode_mode(self.mode));
        Ok(out)
    }

    /// Decodes a handshake from the first [`HANDSHAKE_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FramingError> {
        if buf.len() < HANDSHAKE_LEN {
            return Err(FramingError::Short {
                field: "handshake",
                expected: HANDSHAKE_LEN,
                actual: buf.len(),
            });
        }

        let declared_duration = decode_duration(&buf[..DURATION_WIDTH])?;
        let client_start_time =
            decode_start_time(&buf[DURATION_WIDTH..DURATION_WIDTH + START_TIME_WIDTH])?;
        let mode = decode_mode(&buf[DURATION_WIDTH + START_TIME_WIDTH..HANDSHAKE_LEN])?;

        Ok(Self {
            declared_duration,
            client_start_time,
            mode,
        })
    }

    /// Checks that decoded values are in a plausible range.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for a duration outside
    /// `1..=MAX_DURATION_SECS` or a start time that is not a positive,
    /// finite number.
    pub fn validate(&self) -> crate::Result<()> {
        if !(1..=MAX_DURATION_SECS).contains(&self.declared_duration) {
            return Err(crate::Error::Protocol(format!(
                "declared duration {} out of range 1-{}",
                self.declared_duration, MAX_DURATION_SECS
            )));
        }

        if !self.client_start_time.is_finite() || self.client_start_time <= 0.0 {
            return Err(crate::Error::Protocol(format!(
                "implausible client start time {}",
                self.client_start_time
            )));
        }

        Ok(())
    }
}

fn pad_field<const W: usize>(field: &'static str, text: &str) -> Result<[u8; W], FramingError> {
    let bytes = text.as_bytes();
    if bytes.len() > W {
        return Err(FramingError::TooWide {
            field,
            value: text.to_string(),
            width: W,
        });
    }
    let mut out = [FILLER; W];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// Returns the content of a fixed-width field with the filler stripped.
fn field_content<'a>(
    field: &'static str,
    buf: &'a [u8],
    width: usize,
) -> Result<&'a [u8], FramingError> {
    if buf.len() < width {
        return Err(FramingError::Short {
            field,
            expected: width,
            actual: buf.len(),
        });
    }
    let buf = &buf[..width];
    let end = buf.iter().position(|&b| b == FILLER).unwrap_or(width);
    if buf[end..].iter().any(|&b| b != FILLER) {
        return Err(FramingError::UnexpectedTerminator { field });
    }
    Ok(&buf[..end])
}

fn numeric_text<'a>(
    field: &'static str,
    content: &'a [u8],
    allowed: impl Fn(u8) -> bool,
) -> Result<&'a str, FramingError> {
    let non_numeric = || FramingError::NonNumeric {
        field,
        value: String::from_utf8_lossy(content).into_owned(),
    };
    if content.is_empty() || !content.iter().all(|&b| allowed(b)) {
        return Err(non_numeric());
    }
    std::str::from_utf8(content).map_err(|_| non_numeric())
}

/// Encodes a duration in seconds as a fixed-width decimal field.
pub fn encode_duration(secs: i64) -> Result<[u8; DURATION_WIDTH], FramingError> {
    pad_field("duration", &secs.to_string())
}

/// Decodes a duration field. Range checks are left to
/// [`ControlHandshake::validate`].
///
/// # Examples
///
/// ```
/// use simpleperf::protocol::{decode_duration, encode_duration, FramingError};
///
/// assert_eq!(decode_duration(&encode_duration(42).unwrap()).unwrap(), 42);
/// assert!(matches!(
///     decode_duration(b"4"),
///     Err(FramingError::Short { .. })
/// ));
/// ```
pub fn decode_duration(buf: &[u8]) -> Result<i64, FramingError> {
    let content = field_content("duration", buf, DURATION_WIDTH)?;
    let text = numeric_text("duration", content, |b| b.is_ascii_digit() || b == b'-')?;
    text.parse().map_err(|_| FramingError::NonNumeric {
        field: "duration",
        value: text.to_string(),
    })
}

/// Encodes an epoch timestamp with microsecond resolution.
pub fn encode_start_time(epoch_secs: f64) -> Result<[u8; START_TIME_WIDTH], FramingError> {
    pad_field("start time", &format!("{:.6}", epoch_secs))
}

pub fn decode_start_time(buf: &[u8]) -> Result<f64, FramingError> {
    let content = field_content("start time", buf, START_TIME_WIDTH)?;
    let text = numeric_text("start time", content, |b| {
        b.is_ascii_digit() || b == b'.' || b == b'-'
    })?;
    text.parse().map_err(|_| FramingError::NonNumeric {
        field: "start time",
        value: text.to_string(),
    })
}

pub fn encode_mode(mode: TransferMode) -> [u8; MODE_WIDTH] {
    match mode {
        TransferMode::Bytes => *NUM_TOKEN,
        TransferMode::Time => [FILLER; MODE_WIDTH],
    }
}

pub fn decode_mode(buf: &[u8]) -> Result<TransferMode, FramingError> {
    let content = field_content("mode", buf, MODE_WIDTH)?;
    if content.is_empty() {
        Ok(TransferMode::Time)
    } else if content == NUM_TOKEN {
        Ok(TransferMode::Bytes)
    } else {
        Err(FramingError::UnknownMode(
            String::from_utf8_lossy(content).into_owned(),
        ))
    }
}

/// Finds the first occurrence of `needle` in `haystack`.
pub fn find_sentinel(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Incremental sentinel search over a stream of reads.
///
/// Keeps the last `sentinel.len() - 1` bytes of the previous read so a
/// sentinel split across two reads is still found. Offsets returned by
/// [`feed`](Self::feed) are absolute positions in the stream.
///
/// # Examples
///
/// ```
/// use simpleperf::protocol::{SentinelScanner, BYE};
///
/// let mut scanner = SentinelScanner::new(BYE);
/// assert_eq!(scanner.feed(&[0u8; 10]), None);
/// assert_eq!(scanner.feed(b"\0\0B"), None);
/// assert_eq!(scanner.feed(b"YE"), Some(12));
/// ```
#[derive(Debug, Clone)]
pub struct SentinelScanner {
    sentinel: &'static [u8],
    tail: Vec<u8>,
    consumed: u64,
}

impl SentinelScanner {
    pub fn new(sentinel: &'static [u8]) -> Self {
        Self {
            sentinel,
            tail: Vec::with_capacity(sentinel.len()),
            consumed: 0,
        }
    }

    /// Total bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Feeds the next read and returns the stream offset where the
    /// sentinel starts, if it has now been seen.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<u64> {
        let base = self.consumed;
        self.consumed += chunk.len() as u64;
        let keep = self.sentinel.len().saturating_sub(1);

        if !self.tail.is_empty() {
            let head = &chunk[..chunk.len().min(keep)];
            let mut joined = self.tail.clone();
            joined.extend_from_slice(head);
            if let Some(pos) = find_sentinel(&joined, self.sentinel) {
                return Some(base - self.tail.len() as u64 + pos as u64);
            }
        }

        if let Some(pos) = find_sentinel(chunk, self.sentinel) {
            return Some(base + pos as u64);
        }

        if chunk.len() >= keep {
            self.tail.clear();
            self.tail.extend_from_slice(&chunk[chunk.len() - keep..]);
        } else {
            self.tail.extend_from_slice(chunk);
            let excess = self.tail.len().saturating_sub(keep);
            self.tail.drain(..excess);
        }
        None
    }
}

/// Current wall clock in epoch seconds.
pub fn epoch_seconds() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Writes the encoded handshake.
pub async fn write_handshake<W: AsyncWrite + Unpin>(
    writer: &mut W,
    handshake: &ControlHandshake,
) -> crate::Result<()> {
    let bytes = handshake.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly [`HANDSHAKE_LEN`] bytes and decodes them.
///
/// End of stream before the full handshake has arrived is reported as
/// `FramingError::Short` with the number of bytes actually received.
pub async fn read_handshake<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> crate::Result<ControlHandshake> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    let mut filled = 0;
    while filled < HANDSHAKE_LEN {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(FramingError::Short {
                field: "handshake",
                expected: HANDSHAKE_LEN,
                actual: filled,
            }
            .into());
        }
        filled += n;
    }
    Ok(ControlHandshake::decode(&buf)?)
}

pub async fn write_bye<W: AsyncWrite + Unpin>(writer: &mut W) -> crate::Result<()> {
    writer.write_all(BYE).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> crate::Result<()> {
    writer.write_all(ACK_TOKEN).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads until the `ACK` sentinel appears within [`SENTINEL_WINDOW`] bytes.
pub async fn read_ack<R: AsyncRead + Unpin>(reader: &mut R) -> crate::Result<()> {
    let mut buf = [0u8; SENTINEL_WINDOW];
    let mut filled = 0;
    loop {
        let n = reader.read(&mut buf[filled..]).await?;
        filled += n;
        if find_sentinel(&buf[..filled], ACK).is_some() {
            return Ok(());
        }
        if n == 0 || filled == SENTINEL_WINDOW {
            return Err(FramingError::MissingSentinel("ACK").into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_len() {
        assert_eq!(HANDSHAKE_LEN, 43);
    }

    #[test]
    fn test_duration_field_layout() {
        let encoded = encode_duration(25).unwrap();
        assert_eq!(&encoded, b"25\0\0\0\0\0\0");
    }

    #[test]
    fn test_duration_too_wide() {
        assert!(encode_duration(MAX_DURATION_SECS).is_ok());
        assert!(matches!(
            encode_duration(MAX_DURATION_SECS + 1),
            Err(FramingError::TooWide { .. })
        ));
    }

    #[test]
    fn test_duration_non_numeric() {
        let mut field = [FILLER; DURATION_WIDTH];
        field[..3].copy_from_slice(b"abc");
        assert!(matches!(
            decode_duration(&field),
            Err(FramingError::NonNumeric { .. })
        ));

        // an empty field is not a number either
        assert!(matches!(
            decode_duration(&[FILLER; DURATION_WIDTH]),
            Err(FramingError::NonNumeric { .. })
        ));
    }

    #[test]
    fn test_duration_old_style_terminator_rejected() {
        assert!(matches!(
            decode_duration(b"25END\0\0\0"),
            Err(FramingError::NonNumeric { .. })
        ));
    }

    #[test]
    fn test_unexpected_terminator() {
        assert_eq!(
            decode_duration(b"2\05\0\0\0\0\0"),
            Err(FramingError::UnexpectedTerminator { field: "duration" })
        );
    }

    #[test]
    fn test_negative_duration_decodes() {
        // range checks belong to validation, not framing
        let encoded = encode_duration(-5).unwrap();
        assert_eq!(decode_duration(&encoded).unwrap(), -5);
    }

    #[test]
    fn test_short_start_time() {
        let encoded = encode_start_time(1_700_000_000.5).unwrap();
        assert!(matches!(
            decode_start_time(&encoded[..10]),
            Err(FramingError::Short {
                expected: START_TIME_WIDTH,
                actual: 10,
                ..
            })
        ));
    }

    #[test]
    fn test_start_time_rejects_special_values() {
        let inf = pad_field::<START_TIME_WIDTH>("start time", "inf").unwrap();
        assert!(decode_start_time(&inf).is_err());
        let nan = pad_field::<START_TIME_WIDTH>("start time", "NaN").unwrap();
        assert!(decode_start_time(&nan).is_err());
    }

    #[test]
    fn test_mode_field() {
        assert_eq!(decode_mode(&encode_mode(TransferMode::Time)).unwrap(), TransferMode::Time);
        assert_eq!(decode_mode(b"NUM").unwrap(), TransferMode::Bytes);
        assert!(matches!(decode_mode(b"XYZ"), Err(FramingError::UnknownMode(_))));
    }

    #[test]
    fn test_handshake_short_buffer() {
        let hs = ControlHandshake::new(3, 1_700_000_000.0, TransferMode::Time);
        let bytes = hs.encode().unwrap();
        assert!(matches!(
            ControlHandshake::decode(&bytes[..HANDSHAKE_LEN - 1]),
            Err(FramingError::Short { .. })
        ));
    }

    #[test]
    fn test_handshake_validate() {
        let ok = ControlHandshake::new(10, 1_700_000_000.0, TransferMode::Time);
        assert!(ok.validate().is_ok());

        let zero = ControlHandshake::new(0, 1_700_000_000.0, TransferMode::Time);
        assert!(matches!(zero.validate(), Err(crate::Error::Protocol(_))));

        let negative = ControlHandshake::new(-5, 1_700_000_000.0, TransferMode::Time);
        assert!(matches!(negative.validate(), Err(crate::Error::Protocol(_))));

        let bad_clock = ControlHandshake::new(10, -1.0, TransferMode::Time);
        assert!(matches!(bad_clock.validate(), Err(crate::Error::Protocol(_))));
    }

    #[test]
    fn test_find_sentinel() {
        assert_eq!(find_sentinel(b"xxBYExx", BYE), Some(2));
        assert_eq!(find_sentinel(b"BY", BYE), None);
        assert_eq!(find_sentinel(b"", BYE), None);
    }

    #[test]
    fn test_scanner_sentinel_at_end_of_payload_read() {
        let mut scanner = SentinelScanner::new(BYE);
        assert_eq!(scanner.feed(&PAYLOAD_CHUNK), None);

        let mut last = PAYLOAD_CHUNK[..997].to_vec();
        last.extend_from_slice(BYE);
        assert_eq!(scanner.feed(&last), Some(1997));
    }

    #[test]
    fn test_scanner_sentinel_split_across_reads() {
        let mut scanner = SentinelScanner::new(BYE);
        let mut first = PAYLOAD_CHUNK.to_vec();
        first.push(b'B');
        assert_eq!(scanner.feed(&first), None);
        assert_eq!(scanner.feed(b"Y"), None);
        assert_eq!(scanner.feed(b"E"), Some(1000));
    }

    #[test]
    fn test_scanner_ignores_payload() {
        let mut scanner = SentinelScanner::new(BYE);
        for _ in 0..5 {
            assert_eq!(scanner.feed(&PAYLOAD_CHUNK), None);
        }
        assert_eq!(scanner.consumed(), 5000);
    }

    #[tokio::test]
    async fn test_read_handshake_fragmented() {
        let hs = ControlHandshake::new(7, 1_700_000_123.456789, TransferMode::Bytes);
        let bytes = hs.encode().unwrap();

        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            // dribble the handshake out a few bytes at a time
            for piece in bytes.chunks(5) {
                client.write_all(piece).await.unwrap();
                client.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let decoded = read_handshake(&mut server).await.unwrap();
        assert_eq!(decoded.declared_duration, 7);
        assert_eq!(decoded.mode, TransferMode::Bytes);
        assert!((decoded.client_start_time - 1_700_000_123.456789).abs() < 1e-5);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_handshake_truncated_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"25\0\0\0\0").await.unwrap();
        drop(client);

        match read_handshake(&mut server).await {
            Err(crate::Error::Framing(FramingError::Short { actual, .. })) => {
                assert_eq!(actual, 6)
            }
            other => panic!("expected short handshake, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_ack_within_window() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_ack(&mut server).await.unwrap();
        read_ack(&mut client).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_ack_missing() {
        let (mut client, mut server) = tokio::io::duplex(128);
        server.write_all(&[b'x'; SENTINEL_WINDOW]).await.unwrap();
        assert!(matches!(
            read_ack(&mut client).await,
            Err(crate::Error::Framing(FramingError::MissingSentinel("ACK")))
        ));

        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        assert!(read_ack(&mut client).await.is_err());
    }

    // ============================================================
    // Property-Based Tests
    // ============================================================

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: every duration in 1..=999 survives the codec
            #[test]
            fn prop_duration_roundtrip(secs in 1i64..=999) {
                let encoded = encode_duration(secs).unwrap();
                prop_assert_eq!(encoded.len(), DURATION_WIDTH);
                prop_assert_eq!(decode_duration(&encoded).unwrap(), secs);
            }

            /// Property: epoch timestamps survive within microsecond precision
            #[test]
            fn prop_start_time_roundtrip(ts in 1.0e9f64..2.0e9) {
                let encoded = encode_start_time(ts).unwrap();
                let decoded = decode_start_time(&encoded).unwrap();
                prop_assert!((decoded - ts).abs() < 1e-5);
            }

            /// Property: a full handshake round-trips regardless of mode
            #[test]
            fn prop_handshake_roundtrip(
                secs in 1i64..=MAX_DURATION_SECS,
                ts in 1.0e9f64..2.0e9,
                bytes_mode in any::<bool>(),
            ) {
                let mode = if bytes_mode { TransferMode::Bytes } else { TransferMode::Time };
                let hs = ControlHandshake::new(secs, ts, mode);
                let decoded = ControlHandshake::decode(&hs.encode().unwrap()).unwrap();
                prop_assert_eq!(decoded.declared_duration, secs);
                prop_assert_eq!(decoded.mode, mode);
                prop_assert!((decoded.client_start_time - ts).abs() < 1e-5);
                prop_assert!(decoded.validate().is_ok());
            }

            /// Property: BYE is found wherever the read boundaries fall
            #[test]
            fn prop_scanner_any_split(payload in 0usize..3000, cut in 1usize..64) {
                let mut stream = vec![0u8; payload];
                stream.extend_from_slice(BYE);

                let mut scanner = SentinelScanner::new(BYE);
                let mut found = None;
                for piece in stream.chunks(cut) {
                    if let Some(pos) = scanner.feed(piece) {
                        found = Some(pos);
                        break;
                    }
                }
                prop_assert_eq!(found, Some(payload as u64));
            }
        }
    }
}
