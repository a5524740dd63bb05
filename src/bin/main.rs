use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use simpleperf::config::{parse_byte_target, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT};
use simpleperf::interval_reporter::{run_reporter_task, Reporter};
use simpleperf::measurements::{render_header, render_row, render_separator};
use simpleperf::{
    Client, ClientReport, DisplayUnit, ReportSink, Role, Server, TransferConfig, TransferResult,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "simpleperf")]
#[command(about = "A minimal TCP throughput tester", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// IPv4 address to bind to
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: Ipv4Addr,

        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Unit for the volume column (B, KB or MB)
        #[arg(short, long, default_value = "MB")]
        format: DisplayUnit,

        /// Maximum number of concurrent sessions
        #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
        max_connections: usize,

        /// Exit after serving a single session
        #[arg(long)]
        once: bool,
    },

    /// Run in client mode
    Client {
        /// Server IPv4 address
        #[arg(short = 'I', long = "serverip", default_value = "127.0.0.1")]
        server_ip: Ipv4Addr,

        /// Server port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Transfer duration in seconds
        #[arg(short = 't', long, default_value = "25")]
        time: u64,

        /// Print a row every N seconds
        #[arg(short, long)]
        interval: Option<u64>,

        /// Send this many bytes instead of running for a fixed time (e.g. 10MB)
        #[arg(short = 'n', long = "num", value_parser = parse_byte_target)]
        num: Option<u64>,

        /// Number of parallel connections
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Unit for the volume column (B, KB or MB)
        #[arg(short, long, default_value = "MB")]
        format: DisplayUnit,

        /// Print results as JSON
        #[arg(short = 'J', long)]
        json: bool,
    },
}

/// Prints rows as a table while they arrive.
struct TablePrinter {
    role: Role,
    state: Mutex<PrinterState>,
}

#[derive(Default)]
struct PrinterState {
    header_printed: bool,
    last_was_interval: bool,
}

impl TablePrinter {
    fn new(role: Role) -> Self {
        Self {
            role,
            state: Mutex::new(PrinterState::default()),
        }
    }
}

impl ReportSink for TablePrinter {
    fn on_row(&self, row: &TransferResult) {
        let mut state = self.state.lock();
        if !state.header_printed {
            println!("{}", render_header(self.role));
            state.header_printed = true;
        }
        if row.is_total() && state.last_was_interval {
            println!("{}", render_separator());
        }
        state.last_was_interval = !row.is_total();
        println!("{}", render_row(row));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            bind,
            port,
            format,
            max_connections,
            once,
        } => {
            let mut config = TransferConfig::server(bind, port)
                .with_display_unit(format)
                .with_max_connections(max_connections);
            if once {
                config = config.with_session_limit(1);
            }
            config.validate()?;

            let (reporter, receiver) = Reporter::new();
            let printer = tokio::spawn(run_reporter_task(
                receiver,
                Arc::new(TablePrinter::new(Role::Server)),
            ));

            let server = Server::bind(config).await?.with_sink(Arc::new(reporter.clone()));

            println!("{}", "-".repeat(45));
            println!("A simpleperf server is listening on port {}", port);
            println!("{}", "-".repeat(45));

            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    trigger.cancel();
                }
            });

            server.run_until(shutdown).await?;
            reporter.complete();
            printer.await?;
        }

        Commands::Client {
            server_ip,
            port,
            time,
            interval,
            num,
            parallel,
            format,
            json,
        } => {
            let mut config = TransferConfig::client(server_ip, port)
                .with_duration(Duration::from_secs(time))
                .with_parallel(parallel)
                .with_display_unit(format)
                .with_json(json);
            if let Some(secs) = interval {
                config = config.with_interval(Duration::from_secs(secs));
            }
            if let Some(bytes) = num {
                config = config.with_byte_target(bytes);
            }
            config.validate()?;

            let report = run_client(config).await?;
            let failed = report.failures().count();
            if failed > 0 {
                anyhow::bail!(
                    "{} of {} connection(s) failed",
                    failed,
                    report.sessions.len()
                );
            }
        }
    }

    Ok(())
}

/// Runs the client, printing a live table unless JSON output was asked for.
async fn run_client(config: TransferConfig) -> anyhow::Result<ClientReport> {
    if config.json {
        let report = Client::new(config).run().await?;
        println!("{}", report.to_json()?);
        return Ok(report);
    }

    println!("{}", "-".repeat(61));
    println!(
        "A simpleperf client connecting to server {}, port {}",
        config.bind_addr, config.port
    );
    println!("{}", "-".repeat(61));

    let (reporter, receiver) = Reporter::new();
    let printer = tokio::spawn(run_reporter_task(
        receiver,
        Arc::new(TablePrinter::new(Role::Client)),
    ));
    let report = Client::new(config)
        .with_sink(Arc::new(reporter.clone()))
        .run()
        .await?;
    reporter.complete();
    printer.await?;
    Ok(report)
}
