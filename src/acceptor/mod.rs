use std::net::SocketAddr;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::{lookup_host, TcpListener};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::client::Client;
use crate::config::ConnType;
use crate::recorder::RecordEntry;

/// One listening port of the tarpit.
///
/// Each acceptor owns its listener outright and runs independently of the
/// others; a busy port never slows its siblings.
pub struct Acceptor {
    conn_type: ConnType,
    host: String,
    port: u16,
    interval: Duration,
    max_clients: usize,
    live: Arc<AtomicI64>,
    clients: mpsc::Sender<Client>,
    records: mpsc::Sender<RecordEntry>,
}

impl Acceptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn_type: ConnType,
        host: String,
        port: u16,
        interval: Duration,
        max_clients: usize,
        live: Arc<AtomicI64>,
        clients: mpsc::Sender<Client>,
        records: mpsc::Sender<RecordEntry>,
    ) -> Self {
        Self {
            conn_type,
            host,
            port,
            interval,
            max_clients,
            live,
            clients,
            records,
        }
    }

    /// Bind the listener and announce it.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.resolve_addr().await?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("listening on {addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        info!(addr = %local_addr, conn_type = %self.conn_type, "listening");

        Ok(listener)
    }

    /// Resolve the bind address, honoring the configured address family.
    async fn resolve_addr(&self) -> Result<SocketAddr> {
        let spec = format!("{}:{}", self.host, self.port);
        let mut addrs = lookup_host(spec.as_str())
            .await
            .with_context(|| format!("resolving {spec}"))?;

        addrs
            .find(|addr| match self.conn_type {
                ConnType::Tcp => true,
                ConnType::Tcp4 => addr.is_ipv4(),
                ConnType::Tcp6 => addr.is_ipv6(),
            })
            .ok_or_else(|| anyhow!("no {} address for {}", self.conn_type, spec))
    }

    /// Accept connections forever.
    ///
    /// Every accepted peer waits inside [`Client::new`] for a free slot, so
    /// past the ceiling the accept loop itself parks and later arrivals sit
    /// in the kernel backlog. An accept error is fatal: a tarpit with a dead
    /// listener is worse than a crash a supervisor can restart.
    pub async fn run(self, listener: TcpListener) {
        loop {
            let (stream, _remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(port = self.port, error = %e, "accept failed");
                    std::process::exit(1);
                }
            };

            let client = match Client::new(
                stream,
                self.interval,
                Arc::clone(&self.live),
                self.max_clients,
            )
            .await
            {
                Ok(client) => client,
                Err(e) => {
                    debug!(port = self.port, error = %e, "discarding unusable connection");
                    continue;
                }
            };

            let start = RecordEntry::Start {
                ip: client.remote_ip().to_string(),
                local_port: client.local_port().to_string(),
            };

            // A full records channel blocks here, which slows accepts and
            // pushes new arrivals back into the kernel backlog.
            if self.records.send(start).await.is_err() {
                return;
            }
            if self.clients.send(client).await.is_err() {
                return;
            }
        }
    }
}
