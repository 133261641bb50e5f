use tokio::sync::mpsc;
use tracing::debug;

use crate::client::Client;
use crate::recorder::RecordEntry;

/// Schedules sends for every trapped client.
///
/// A single dispatcher pulls clients off a bounded queue and spawns one
/// short-lived task per send. The task, not the dispatcher, sleeps out the
/// client's pacing deadline and rides out slow sockets, so one stuck peer
/// delays only itself. A live client cycles queue → send task → queue until
/// a write fails; at any instant it sits in exactly one of the two places.
pub struct Pacer {
    clients_tx: mpsc::Sender<Client>,
    clients_rx: mpsc::Receiver<Client>,
    records: mpsc::Sender<RecordEntry>,
    max_line_length: u64,
}

impl Pacer {
    /// Create a pacer whose queue holds `max_clients` entries.
    ///
    /// Capacity equal to the admission ceiling means a re-enqueue can never
    /// block: there are never more clients alive than queue slots.
    pub fn new(
        max_clients: usize,
        max_line_length: u64,
        records: mpsc::Sender<RecordEntry>,
    ) -> Self {
        let (clients_tx, clients_rx) = mpsc::channel(max_clients);

        Self {
            clients_tx,
            clients_rx,
            records,
            max_line_length,
        }
    }

    /// Queue handle for the acceptors to submit new clients.
    pub fn queue(&self) -> mpsc::Sender<Client> {
        self.clients_tx.clone()
    }

    /// Dispatch forever.
    pub async fn run(mut self) {
        while let Some(client) = self.clients_rx.recv().await {
            tokio::spawn(pace_one(
                client,
                self.clients_tx.clone(),
                self.records.clone(),
                self.max_line_length,
            ));
        }
    }
}

/// Perform one paced send, then route the client back to the queue or out
/// of the system.
async fn pace_one(
    mut client: Client,
    requeue: mpsc::Sender<Client>,
    records: mpsc::Sender<RecordEntry>,
    max_line_length: u64,
) {
    match client.send(max_line_length).await {
        Ok(bytes_sent) => {
            let milliseconds_spent = client.milliseconds_since_last();
            let ip = client.remote_ip().to_string();
            let local_port = client.local_port().to_string();

            if requeue.send(client).await.is_err() {
                return;
            }

            let _ = records
                .send(RecordEntry::Send {
                    ip,
                    local_port,
                    bytes_sent: bytes_sent as u64,
                    milliseconds_spent,
                })
                .await;
        }
        Err(e) => {
            debug!(remote = %client.remote_ip(), error = %e, "write failed, dropping client");

            let milliseconds_spent = client.milliseconds_since_last();
            let ip = client.remote_ip().to_string();
            let local_port = client.local_port().to_string();
            client.close();

            let _ = records
                .send(RecordEntry::Stop {
                    ip,
                    local_port,
                    milliseconds_spent,
                })
                .await;
        }
    }
}
