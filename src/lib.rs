use thiserror::Error;

pub mod cli;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod entry;
pub mod job;
pub mod logging;
pub mod memory;
pub mod proctree;
pub mod protocol;
pub mod queue;
pub mod request;
pub mod runner;
pub mod server;
pub mod shutdown;
pub mod supervisor;

#[derive(Error, Debug)]
pub enum OverseerError {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error(transparent)]
    Request(#[from] request::Error),
    #[error(transparent)]
    Cli(#[from] cli::Error),
    #[error(transparent)]
    Job(#[from] job::Error),
    #[error(transparent)]
    Supervisor(#[from] supervisor::Error),
    #[error(transparent)]
    Runner(#[from] runner::Error),
    #[error(transparent)]
    Memory(#[from] memory::Error),
    #[error(transparent)]
    Controller(#[from] controller::Error),
    #[error(transparent)]
    Server(#[from] server::Error),
}

/// Marker for a builder slot that has not been filled yet.
pub struct Empty;

/// Timestamp layout shared by log lines and memory history.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
