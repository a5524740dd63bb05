use crate::config::TransferConfig;
use crate::measurements::{NullSink, ReportSink};
use crate::session::Session;
use crate::{Error, Result};
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// First pause after a failed `accept`, doubled per consecutive failure.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Longest pause between failed `accept` calls.
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Delay before the next `accept` after `failures` consecutive errors.
fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(MAX_ACCEPT_BACKOFF)
}

/// Throughput test server.
///
/// The `Server` owns a bound listener and runs one session task per accepted
/// connection. A failed session is logged and never stops the accept loop.
/// At most `max_connections` sessions run at once; further connections wait
/// in the listen backlog until a slot frees up.
///
/// # Examples
///
/// ```no_run
/// use simpleperf::{Server, TransferConfig};
/// use std::net::Ipv4Addr;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TransferConfig::server(Ipv4Addr::UNSPECIFIED, 8088);
/// let server = Server::bind(config).await?;
///
/// println!("listening on {}", server.local_addr()?);
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    config: Arc<TransferConfig>,
    sink: Arc<dyn ReportSink>,
    limiter: Arc<Semaphore>,
}

impl Server {
    /// Binds the configured address and port.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bind` if the address is unavailable or already in use.
    pub async fn bind(config: TransferConfig) -> Result<Self> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        let limiter = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Ok(Self {
            listener,
            config: Arc::new(config),
            sink: Arc::new(NullSink),
            limiter,
        })
    }

    /// Sets where finished rows are delivered. Defaults to [`NullSink`].
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Address actually bound; useful when the configured port is 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the session limit (if any) is reached.
    pub async fn run(&self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Like [`Server::run`], but also stops accepting once `shutdown` is
    /// cancelled. Sessions already in flight are allowed to finish.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        info!("server listening on {}", self.local_addr()?);

        let mut sessions = JoinSet::new();
        let mut accepted = 0usize;
        let mut accept_failures = 0u32;

        loop {
            if let Some(limit) = self.config.session_limit {
                if accepted >= limit {
                    debug!("session limit {} reached", limit);
                    break;
                }
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.limiter.clone().acquire_owned() => permit
                    .map_err(|e| Error::Task(format!("connection limiter closed: {}", e)))?,
            };

            let (stream, addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok(conn) => {
                        accept_failures = 0;
                        conn
                    }
                    Err(e) => {
                        // persistent errors such as EMFILE
                        accept_failures = accept_failures.saturating_add(1);
                        error!("Error accepting connection: {}", e);
                        drop(permit);
                        tokio::time::sleep(accept_backoff(accept_failures)).await;
                        continue;
                    }
                },
            };

            accepted += 1;
            info!("New connection from {}", addr);
            let config = self.config.clone();
            let sink = self.sink.clone();
            sessions.spawn(serve_connection(stream, addr, config, sink, permit));

            while let Some(finished) = sessions.try_join_next() {
                log_join(finished);
            }
        }

        if !sessions.is_empty() {
            debug!("waiting for {} in-flight session(s)", sessions.len());
        }
        while let Some(finished) = sessions.join_next().await {
            log_join(finished);
        }

        info!("server on {} stopped after {} session(s)", self.local_addr()?, accepted);
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<TransferConfig>,
    sink: Arc<dyn ReportSink>,
    _permit: OwnedSemaphorePermit,
) {
    let mut session = Session::new(stream, addr);
    if let Err(e) = session.run_server(&config, sink.as_ref()).await {
        error!("Error handling client {}: {}", addr, e);
    }
}

fn log_join(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!("session task failed: {}", e);
    }
}
