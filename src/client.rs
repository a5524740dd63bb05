use crate::config::TransferConfig;
use crate::measurements::{NullSink, ReportSink, SessionReport, TransferResult};
use crate::session::Session;
use crate::{Error, Result};
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;

/// Outcome of a client run: one entry per connection, in connection order.
#[derive(Debug)]
pub struct ClientReport {
    pub sessions: Vec<Result<SessionReport>>,
}

impl ClientReport {
    /// Rows of every successful session, session by session.
    pub fn rows(&self) -> Vec<TransferResult> {
        self.sessions
            .iter()
            .filter_map(|s| s.as_ref().ok())
            .flat_map(|s| s.rows.iter().cloned())
            .collect()
    }

    /// Bytes sent across all successful sessions.
    pub fn total_bytes(&self) -> u64 {
        self.sessions
            .iter()
            .filter_map(|s| s.as_ref().ok())
            .filter_map(|s| s.total())
            .map(|row| row.bytes_moved)
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &Error> {
        self.sessions.iter().filter_map(|s| s.as_ref().err())
    }

    pub fn all_succeeded(&self) -> bool {
        self.sessions.iter().all(|s| s.is_ok())
    }

    /// Rows of every successful session as a pretty-printed JSON array.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.rows())?)
    }
}

/// Throughput test client.
///
/// Opens `parallel` connections to the server, each driven by its own
/// session task. A connection that fails does not affect its siblings.
///
/// # Examples
///
/// ```no_run
/// use simpleperf::{Client, TransferConfig};
/// use std::net::Ipv4Addr;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TransferConfig::client(Ipv4Addr::LOCALHOST, 8088)
///     .with_duration(Duration::from_secs(10))
///     .with_interval(Duration::from_secs(2))
///     .with_parallel(2);
///
/// let report = Client::new(config).run().await?;
/// println!("sent {} bytes", report.total_bytes());
/// # Ok(())
/// # }
/// ```
///
/// Rows can be observed as they are produced:
///
/// ```no_run
/// use simpleperf::{Client, TransferConfig, TransferResult};
/// use std::net::Ipv4Addr;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TransferConfig::client(Ipv4Addr::LOCALHOST, 8088);
/// let client = Client::new(config).with_sink(Arc::new(|row: &TransferResult| {
///     println!("{} {}", row.peer_id(), row.formatted_volume);
/// }));
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Arc<TransferConfig>,
    sink: Arc<dyn ReportSink>,
}

impl Client {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: Arc::new(config),
            sink: Arc::new(NullSink),
        }
    }

    /// Sets where rows are delivered while the run is in progress.
    pub fn with_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Runs all connections to completion.
    ///
    /// # Errors
    ///
    /// Only fails outright when no connections were requested. Errors of
    /// individual connections are reported in [`ClientReport::sessions`].
    pub async fn run(&self) -> Result<ClientReport> {
        let parallel = self.config.parallel;
        if parallel == 0 {
            return Err(Error::Config(
                "at least one parallel connection is required".to_string(),
            ));
        }

        let addr = self.config.socket_addr();
        info!("connecting to {} with {} connection(s)", addr, parallel);

        let handles: Vec<_> = (0..parallel)
            .map(|_| {
                let config = self.config.clone();
                let sink = self.sink.clone();
                tokio::spawn(async move { run_connection(addr, &config, sink.as_ref()).await })
            })
            .collect();

        let mut sessions = Vec::with_capacity(parallel);
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Task(e.to_string())),
            };
            if let Err(e) = &result {
                error!("connection to {} failed: {}", addr, e);
            }
            sessions.push(result);
        }

        Ok(ClientReport { sessions })
    }
}

async fn run_connection(
    addr: SocketAddr,
    config: &TransferConfig,
    sink: &dyn ReportSink,
) -> Result<SessionReport> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| Error::Connect { addr, source })?;
    info!("{} connected with {}", stream.local_addr()?, addr);

    let mut session = Session::new(stream, addr);
    session.run_client(config, sink).await
}
