use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use overseer::{
    config::{RunnerConfig, ServerConfig, DEFAULT_WORKERS},
    dispatcher::Dispatcher,
    entry::EntryStore,
    logging, memory,
    queue::RequestQueue,
    runner::JobRunner,
    server::Server,
    shutdown,
};

/// Remote job execution server.
#[derive(Debug, Parser)]
#[command(name = "overseer", version)]
struct Args {
    /// TCP port to listen on
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,
    /// Number of jobs run concurrently
    #[arg(long, env = "OVERSEER_WORKERS", default_value_t = DEFAULT_WORKERS)]
    workers: usize,
    /// Supervisor executable, defaults to the one next to this binary
    #[arg(long, env = "OVERSEER_SUPERVISOR")]
    supervisor: Option<PathBuf>,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        let mut runner = RunnerConfig::default();
        if let Some(supervisor) = args.supervisor {
            runner.supervisor = supervisor;
        }

        Self { port: args.port, workers: args.workers, runner, ..ServerConfig::default() }
    }
}

#[tokio::main]
async fn main() -> Result<(), overseer::OverseerError> {
    let config = ServerConfig::from(Args::parse());
    logging::init(logging::Target::Stdout);

    let cancel = shutdown::install_shutdown_handler()?;
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("Server starts listening on port {}", config.port);
    info!("Total RAM memory: {} bytes", memory::total_memory()?);
    info!("Supervisor: {}", config.runner.supervisor.display());

    let queue = Arc::new(RequestQueue::new());
    let store = Arc::new(EntryStore::new());
    let runner = Arc::new(JobRunner::new(config.runner.clone(), store.clone()));
    let dispatcher = Dispatcher::start(config.workers, queue.clone(), runner, cancel.clone());
    info!("{} workers waiting for jobs", dispatcher.size());

    let server = Server::new(queue.clone(), store.clone(), config.request_timeout);
    shutdown::log_failure("accept loop stopped", server.serve(listener, cancel.clone()).await);

    // serve only returns early on error; make sure workers stop as well
    cancel.cancel();
    let discarded = queue.drain();
    info!("discarded {} pending request(s)", discarded.len());
    dispatcher.join().await;
    info!("dropped {} memory sample(s)", store.clear());

    Ok(())
}
