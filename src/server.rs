use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Local;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::{
    controller::{self, Controller},
    entry::EntryStore,
    protocol::{self, Command},
    queue::RequestQueue,
    request::{self, PendingRequest, Request},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error(transparent)]
    Invalid(#[from] request::Error),
    #[error(transparent)]
    Controller(#[from] controller::Error),
    #[error("No complete request within {0:?}")]
    Timeout(Duration),
}

/// Accepts connections and routes each decoded request.
#[derive(Debug, Clone)]
pub struct Server {
    queue: Arc<RequestQueue>,
    controller: Controller,
    request_timeout: Duration,
}

impl Server {
    pub fn new(
        queue: Arc<RequestQueue>,
        store: Arc<EntryStore>,
        request_timeout: Duration,
    ) -> Self {
        Self { queue, controller: Controller::new(store), request_timeout }
    }

    /// Serves one request per connection until `cancel` fires.
    ///
    /// Each connection runs on its own task, so a slow peer holds up
    /// neither the accept loop nor shutdown. Failures are confined to the
    /// connection that caused them.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        continue;
                    }
                },
            };

            info!("connection received from {}", peer.ip());
            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("dropping connection from {} on shutdown", peer)
                    }
                    handled = server.handle(stream, peer) => {
                        if let Err(err) = handled {
                            error!("dropping request from {}: {}", peer, err);
                        }
                    }
                }
            });
        }
    }

    async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), Error> {
        let command = tokio::time::timeout(self.request_timeout, Command::read_from(&mut stream))
            .await
            .map_err(|_| Error::Timeout(self.request_timeout))??;

        match Request::try_from(command)? {
            Request::Execute(spec) => {
                let request = PendingRequest::new(spec);
                info!(
                    "queued job {} from {}: {}",
                    request.id(),
                    peer.ip(),
                    request.spec().argv.join(" ")
                );
                self.queue.enqueue(request);
            }
            Request::Query(pid) => {
                let reply = self.controller.query(pid, Local::now());
                let fitted = protocol::fit_reply(&reply);
                if fitted.len() < reply.len() {
                    warn!(
                        "reply to {} trimmed to its newest {} of {} bytes",
                        peer,
                        fitted.len(),
                        reply.len()
                    );
                }
                protocol::write_reply(&mut stream, fitted).await?;
            }
            Request::EnforceMemory(percent) => {
                let killed = self.controller.enforce(percent)?;
                info!("memkill {}% signalled {} process(es)", percent, killed.len());
            }
        }

        Ok(())
    }
}
