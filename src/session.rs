//! One logical transfer over one connection.
//!
//! A [`Session`] owns its socket exclusively and walks through
//! `Handshake -> Streaming -> Finalizing -> Closed`. A session that fails
//! at any step goes straight to `Closed`; its error is returned to the
//! caller and never affects other sessions.

use crate::config::{StopCondition, TransferConfig};
use crate::measurements::{ReportSink, RowKind, SessionReport, TransferResult};
use crate::protocol::{
    epoch_seconds, read_ack, read_handshake, write_ack, write_bye, write_handshake,
    ControlHandshake, TransferMode,
};
use crate::transfer::{recv_bulk, send_bulk, send_intervals, SendLimit};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Control values are being exchanged
    Handshake,
    /// Payload is flowing
    Streaming,
    /// `BYE`/`ACK` exchange and result computation
    Finalizing,
    /// Socket released
    Closed,
}

impl SessionState {
    /// Whether `self -> next` is a legal step.
    ///
    /// ```
    /// use simpleperf::session::SessionState;
    ///
    /// assert!(SessionState::Handshake.can_transition_to(SessionState::Streaming));
    /// assert!(SessionState::Handshake.can_transition_to(SessionState::Closed));
    /// assert!(!SessionState::Handshake.can_transition_to(SessionState::Finalizing));
    /// assert!(!SessionState::Closed.can_transition_to(SessionState::Handshake));
    /// ```
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Handshake, Streaming)
                | (Handshake, Closed)
                | (Streaming, Finalizing)
                | (Streaming, Closed)
                | (Finalizing, Closed)
        )
    }
}

/// Elapsed time as seen by the server.
///
/// Assumes the client and server clocks agree, which holds on loopback or
/// NTP-synced hosts. When the difference is not a positive finite number
/// the server's own measurement since the handshake is used instead.
pub fn server_elapsed(client_start: f64, stopped_at: f64, local_fallback: Duration) -> f64 {
    let synced = stopped_at - client_start;
    if synced.is_finite() && synced > 0.0 {
        synced
    } else {
        warn!(
            "client clock ahead of server by {:.3}s, using server-side timing",
            -synced
        );
        local_fallback.as_secs_f64()
    }
}

/// State for one connection: socket, handshake and running tally.
pub struct Session<S> {
    stream: S,
    peer: SocketAddr,
    state: SessionState,
    handshake: Option<ControlHandshake>,
    bytes_moved: u64,
    elapsed_seconds: f64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: SessionState::Handshake,
            handshake: None,
            bytes_moved: 0,
            elapsed_seconds: 0.0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn handshake(&self) -> Option<&ControlHandshake> {
        self.handshake.as_ref()
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved
    }

    /// Elapsed time of the whole session, set once it has finalized.
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_seconds
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Protocol(format!(
                "invalid session transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!("session {}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
        Ok(())
    }

    fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!("session {}: {:?} -> Closed", self.peer, self.state);
            self.state = SessionState::Closed;
        }
    }

    /// Runs the sending side: handshake, payload, `BYE`/`ACK`, rows.
    ///
    /// Rows go to `sink` as soon as they are produced and are also
    /// returned in the report.
    pub async fn run_client(
        &mut self,
        config: &TransferConfig,
        sink: &dyn ReportSink,
    ) -> Result<SessionReport> {
        let result = self.client_flow(config, sink).await;
        self.close();
        result
    }

    /// Runs the receiving side: validate handshake, drain, acknowledge.
    pub async fn run_server(
        &mut self,
        config: &TransferConfig,
        sink: &dyn ReportSink,
    ) -> Result<SessionReport> {
        let result = self.server_flow(config, sink).await;
        self.close();
        result
    }

    async fn client_flow(
        &mut self,
        config: &TransferConfig,
        sink: &dyn ReportSink,
    ) -> Result<SessionReport> {
        let stop = config.stop_condition();
        let mode = match stop {
            StopCondition::Time(_) => TransferMode::Time,
            StopCondition::Bytes(_) => TransferMode::Bytes,
        };
        let declared = (config.duration.as_secs_f64().ceil() as i64).max(1);

        let session_start = Instant::now();
        let handshake = ControlHandshake::new(declared, epoch_seconds(), mode);
        write_handshake(&mut self.stream, &handshake).await?;
        self.handshake = Some(handshake);
        self.transition(SessionState::Streaming)?;

        let peer = self.peer;
        let unit = config.display_unit;
        let mut report = SessionReport::new(peer);

        let bytes_sent = match config.interval {
            None => {
                let limit = match stop {
                    StopCondition::Time(duration) => SendLimit::until(session_start + duration),
                    StopCondition::Bytes(target) => SendLimit::bytes(target),
                };
                send_bulk(&mut self.stream, limit).await?
            }
            Some(interval) => {
                let interval_secs = interval.as_secs_f64();
                let summary = send_intervals(&mut self.stream, stop, interval, |sample| {
                    let start = sample.index as f64 * interval_secs;
                    let end = match stop {
                        StopCondition::Time(duration) => {
                            (start + interval_secs).min(duration.as_secs_f64())
                        }
                        StopCondition::Bytes(_) => {
                            start + sample.elapsed.as_secs_f64().min(interval_secs)
                        }
                    };
                    let row = TransferResult::new(
                        peer,
                        start,
                        end,
                        sample.elapsed.as_secs_f64(),
                        sample.bytes,
                        unit,
                        RowKind::Interval,
                    );
                    sink.on_row(&row);
                    report.rows.push(row);
                })
                .await?;
                summary.bytes_sent
            }
        };
        self.bytes_moved = bytes_sent;

        self.transition(SessionState::Finalizing)?;
        write_bye(&mut self.stream).await?;
        read_ack(&mut self.stream).await?;
        // total runs from start to ack in every mode
        let elapsed = session_start.elapsed().as_secs_f64();
        let window_end = match stop {
            StopCondition::Time(duration) => duration.as_secs_f64(),
            StopCondition::Bytes(_) => elapsed,
        };
        self.elapsed_seconds = elapsed;

        let total = TransferResult::new(
            peer,
            0.0,
            window_end,
            elapsed,
            bytes_sent,
            unit,
            RowKind::Total,
        );
        info!(
            "sent {} bytes to {} in {:.3}s ({:.2} Mbps)",
            bytes_sent, peer, elapsed, total.rate_mbps
        );
        sink.on_row(&total);
        report.rows.push(total);

        Ok(report)
    }

    async fn server_flow(
        &mut self,
        config: &TransferConfig,
        sink: &dyn ReportSink,
    ) -> Result<SessionReport> {
        let handshake = read_handshake(&mut self.stream).await?;
        let handshake_at = Instant::now();
        handshake.validate()?;
        debug!(
            "session {}: duration={}s start={:.6} mode={:?}",
            self.peer, handshake.declared_duration, handshake.client_start_time, handshake.mode
        );
        self.handshake = Some(handshake);
        self.transition(SessionState::Streaming)?;

        let outcome = recv_bulk(&mut self.stream).await?;
        self.bytes_moved = outcome.bytes_received;

        self.transition(SessionState::Finalizing)?;
        let elapsed = server_elapsed(
            handshake.client_start_time,
            outcome.stopped_at,
            outcome.stopped_instant - handshake_at,
        );
        self.elapsed_seconds = elapsed;
        write_ack(&mut self.stream).await?;

        let window_end = match handshake.mode {
            TransferMode::Time => handshake.declared_duration as f64,
            TransferMode::Bytes => elapsed,
        };
        let row = TransferResult::new(
            self.peer,
            0.0,
            window_end,
            elapsed,
            outcome.bytes_received,
            config.display_unit,
            RowKind::Total,
        );
        info!(
            "received {} bytes from {} in {:.3}s ({:.2} Mbps)",
            outcome.bytes_received, self.peer, elapsed, row.rate_mbps
        );
        sink.on_row(&row);

        let mut report = SessionReport::new(self.peer);
        report.rows.push(row);
        Ok(report)
    }
}
