use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use exitcode::ExitCode;
use futures::StreamExt;
use gcpsd::daemon::{Daemon, DaemonConfig};
use gcpsd::pool::{DEFAULT_POOL_SIZE, Pool};
use gcpsd::projects::ProjectSet;
use gcpsd::server::Server;
use gcpsd::signal::{self, SignalTo, Signals};
use gcpsd::{http, trace};
use hyper::service::service_fn;
use regex::Regex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long in flight requests and the last refresh may take after a
/// shutdown signal.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(60);

fn default_worker_threads() -> usize {
    match std::env::var("GCPSD_WORKER_THREADS") {
        Ok(value) => value
            .parse::<usize>()
            .expect("invalid env value for GCPSD_WORKER_THREADS"),
        Err(_) => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    }
}

#[derive(FromArgs)]
#[argh(
    description = "Discover Google Compute Engine instances and expose them as Prometheus file_sd targets",
    help_triggers("-h", "--help")
)]
pub struct RootCommand {
    #[argh(switch, short = 'v', description = "show version")]
    version: bool,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level"
    )]
    log_level: String,

    #[argh(
        option,
        default = "\"text\".to_string()",
        description = "log format, text or json"
    )]
    log_format: String,

    #[argh(
        option,
        short = 't',
        default = "default_worker_threads()",
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: usize,

    #[argh(
        option,
        default = "SocketAddr::from(([0, 0, 0, 0], 8080))",
        description = "address the HTTP server listens on"
    )]
    listen: SocketAddr,

    #[argh(
        switch,
        description = "write targets to the output path periodically instead of serving HTTP"
    )]
    daemon: bool,

    #[argh(
        option,
        default = "PathBuf::from(\"/etc/prom_sd/targets.json\")",
        description = "targets snapshot path, daemon mode only"
    )]
    output_path: PathBuf,

    #[argh(
        option,
        default = "300",
        description = "refresh interval in seconds, daemon mode only"
    )]
    frequency: u64,

    #[argh(
        option,
        default = "String::new()",
        description = "comma separated project ids, daemon mode only"
    )]
    projects: String,

    #[argh(
        switch,
        description = "discover every project the credentials can list, daemon mode only"
    )]
    projects_auto_discovery: bool,

    #[argh(
        option,
        description = "projects matching this regex are never discovered, daemon mode only"
    )]
    projects_excludes: Option<String>,

    #[argh(
        option,
        default = "DEFAULT_POOL_SIZE",
        description = "number of concurrent discovery workers"
    )]
    workers: usize,

    #[argh(
        switch,
        description = "resolve regions with the regions listing of every project"
    )]
    region_lookup: bool,
}

enum Mode {
    Server(SocketAddr),
    Daemon(DaemonConfig),
}

impl RootCommand {
    #![allow(clippy::print_stdout, clippy::print_stderr)]
    fn show_version(&self) {
        println!("gcpsd {}", env!("CARGO_PKG_VERSION"));
    }

    fn mode(&self) -> Result<Mode, ExitCode> {
        if self.workers == 0 {
            error!(message = "at least one discovery worker is required");
            return Err(exitcode::USAGE);
        }

        if !self.daemon {
            if self.output_path != PathBuf::from("/etc/prom_sd/targets.json") {
                warn!(message = "output path is ignored in server mode");
            }
            if self.frequency != 300 {
                warn!(message = "frequency is ignored in server mode");
            }
            if !self.projects.is_empty() {
                warn!(message = "projects are ignored in server mode, pass them per request");
            }
            if self.projects_auto_discovery {
                warn!(message = "projects auto discovery is ignored in server mode, pass it per request");
            }
            if self.projects_excludes.is_some() {
                warn!(message = "projects excludes is ignored in server mode, pass it per request");
            }

            return Ok(Mode::Server(self.listen));
        }

        if self.frequency == 0 {
            error!(message = "frequency must be greater than zero");
            return Err(exitcode::USAGE);
        }

        let excludes = match self.projects_excludes.as_deref() {
            None | Some("") => None,
            Some(pattern) => Some(Regex::new(pattern).map_err(|err| {
                error!(message = "invalid projects excludes", %err);
                exitcode::USAGE
            })?),
        };

        let projects = ProjectSet::parse(&self.projects);
        if projects.is_empty() && !self.projects_auto_discovery {
            warn!(message = "no projects configured and auto discovery is disabled, targets will be empty");
        }

        Ok(Mode::Daemon(DaemonConfig {
            output: self.output_path.clone(),
            frequency: Duration::from_secs(self.frequency),
            projects,
            excludes,
            auto_discovery: self.projects_auto_discovery,
        }))
    }

    pub fn run(&self) -> Result<(), ExitCode> {
        if self.version {
            self.show_version();
            return Ok(());
        }

        let json = match self.log_format.as_str() {
            "text" => false,
            "json" => true,
            _ => {
                eprintln!("unknown log format {:?}, text or json expected", self.log_format);
                return Err(exitcode::USAGE);
            }
        };
        let levels = std::env::var("GCPSD_LOG").unwrap_or_else(|_| trace::levels(&self.log_level));
        let color = std::io::stdout().is_terminal();
        trace::init(color && !json, json, &levels);

        let mode = self.mode()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("gcpsd-worker")
            .worker_threads(self.threads.max(1))
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "build tokio runtime failed", %err);
                exitcode::OSERR
            })?;

        runtime.block_on(async move {
            let signals = signal::os_signals().map_err(|err| {
                error!(message = "install signal handlers failed", %err);
                exitcode::OSERR
            })?;

            let client = gcp::Client::new().await.map_err(|err| {
                error!(message = "create google cloud client failed", %err);
                exitcode::CONFIG
            })?;
            let client = Arc::new(client);

            let shutdown = CancellationToken::new();
            let pool = Pool::spawn(
                client.clone(),
                self.workers,
                self.region_lookup,
                shutdown.clone(),
            );

            let task = match mode {
                Mode::Server(addr) => {
                    let listener = TcpListener::bind(addr).await.map_err(|err| {
                        error!(message = "bind listen address failed", %addr, %err);
                        exitcode::CONFIG
                    })?;

                    info!(
                        message = "start gcpsd",
                        mode = "server",
                        listen = %addr,
                        workers = self.workers,
                        threads = self.threads,
                    );

                    let server = Server::new(pool, client, shutdown.clone());
                    let service = service_fn(move |req| {
                        let server = server.clone();
                        async move { server.handle(req).await }
                    });

                    tokio::spawn(
                        http::serve(listener, service)
                            .with_graceful_shutdown(shutdown.clone())
                            .into_future(),
                    )
                }
                Mode::Daemon(config) => {
                    info!(
                        message = "start gcpsd",
                        mode = "daemon",
                        output = ?config.output,
                        frequency = ?config.frequency,
                        projects = %config.projects,
                        excludes = ?config.excludes.as_ref().map(Regex::as_str),
                        auto_discovery = config.auto_discovery,
                        workers = self.workers,
                        threads = self.threads,
                    );

                    tokio::spawn(Daemon::new(config, pool, client).run(shutdown.clone()))
                }
            };

            supervise(signals, task, shutdown).await
        })?;

        runtime.shutdown_timeout(Duration::from_secs(5));

        Ok(())
    }
}

/// Wait for the mode task or a signal, and drive the shutdown.
async fn supervise(
    signals: Signals,
    mut task: JoinHandle<()>,
    shutdown: CancellationToken,
) -> Result<(), ExitCode> {
    tokio::pin!(signals);

    let signal = tokio::select! {
        signal = signals.next() => signal,
        result = &mut task => {
            return match result {
                Ok(()) => Ok(()),
                Err(err) => {
                    error!(message = "gcpsd stopped unexpectedly", %err);
                    Err(exitcode::SOFTWARE)
                }
            };
        }
    };

    match signal {
        Some(SignalTo::Shutdown) => {
            info!(message = "shutting down", timeout = ?GRACEFUL_TIMEOUT);
            shutdown.cancel();

            tokio::select! {
                result = tokio::time::timeout(GRACEFUL_TIMEOUT, &mut task) => match result {
                    Ok(_) => info!(message = "gcpsd stopped"),
                    Err(_) => {
                        warn!(message = "graceful shutdown timed out");
                        task.abort();
                    }
                },
                _ = signals.next() => {
                    warn!(message = "second signal received, exit immediately");
                    task.abort();
                }
            }
        }
        Some(SignalTo::Quit) | None => {
            info!(message = "quit immediately");
            shutdown.cancel();
            task.abort();
        }
    }

    Ok(())
}
