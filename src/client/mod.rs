use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::{thread_rng, Rng};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// The characters a banner line is drawn from. Everything here is printable
/// ASCII, so the output passes for a chatty but well-formed pre-banner.
const ALPHABET: &[u8] =
    b" abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ01234567890!@#$%^&*()-=_+[]{}|;:',./<>?";

/// One trapped peer.
///
/// Owns the socket exclusively from acceptance until [`Client::close`]. Only
/// the pacer touches a client after construction, so no field needs interior
/// mutability.
pub struct Client {
    stream: TcpStream,
    interval: Duration,
    /// Earliest instant the next line may be written.
    next: tokio::time::Instant,
    start: std::time::Instant,
    last: std::time::Instant,
    bytes_sent: u64,
    remote_ip: String,
    local_port: String,
    live: Arc<AtomicI64>,
}

impl Client {
    /// Wrap an accepted connection once a client slot is free.
    ///
    /// Blocks until the shared live-client count drops below `max_clients`,
    /// polling every `interval`, then claims a slot. The accepted socket
    /// stays parked at the TCP level while it waits; nothing is written to
    /// it. `next` starts at the current instant, so the first line goes out
    /// on the first dispatch with no delay.
    pub async fn new(
        stream: TcpStream,
        interval: Duration,
        live: Arc<AtomicI64>,
        max_clients: usize,
    ) -> Result<Self> {
        let remote = stream.peer_addr().context("reading peer address")?;
        let local = stream.local_addr().context("reading local address")?;

        let max = max_clients as i64;
        let occupied = loop {
            let n = live.load(Ordering::SeqCst);
            if n < max
                && live
                    .compare_exchange(n, n + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                break n + 1;
            }
            tokio::time::sleep(interval).await;
        };

        let remote_ip = remote.ip().to_string();
        let local_port = local.port().to_string();

        debug!(
            remote = %remote_ip,
            local_port = %local_port,
            live = occupied,
            max = max_clients,
            "connection accepted",
        );

        let now = std::time::Instant::now();

        Ok(Self {
            stream,
            interval,
            next: tokio::time::Instant::now(),
            start: now,
            last: now,
            bytes_sent: 0,
            remote_ip,
            local_port,
            live,
        })
    }

    /// Write one junk line, honoring the pacing deadline.
    ///
    /// Sleeps until `next` if it has not passed yet, then advances `next` by
    /// the pacing interval and writes the whole line in one call. Returns
    /// the number of bytes written; the caller closes the client on error.
    pub async fn send(&mut self, max_line_length: u64) -> std::io::Result<usize> {
        if tokio::time::Instant::now() < self.next {
            tokio::time::sleep_until(self.next).await;
        }
        self.next = tokio::time::Instant::now() + self.interval;

        let line = banner_line(max_line_length);
        self.stream.write_all(&line).await?;
        self.bytes_sent += line.len() as u64;

        Ok(line.len())
    }

    /// Milliseconds elapsed since the previous call (or since acceptance).
    ///
    /// Also moves the `last` mark to now; the recorder's time accounting
    /// depends on that side effect.
    pub fn milliseconds_since_last(&mut self) -> i64 {
        let spent = self.last.elapsed().as_millis() as i64;
        self.last = std::time::Instant::now();
        spent
    }

    /// The peer's IP address in display form.
    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// The local listening port in display form.
    pub fn local_port(&self) -> &str {
        &self.local_port
    }

    /// Cumulative bytes written to this peer.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Release the client slot and drop the socket.
    pub fn close(self) {
        let remaining = self.live.fetch_sub(1, Ordering::SeqCst) - 1;

        debug!(
            remote = %self.remote_ip,
            local_port = %self.local_port,
            trapped_seconds = self.start.elapsed().as_secs_f64(),
            bytes = self.bytes_sent,
            live = remaining,
            "connection closed",
        );
    }
}

/// Generate one banner line: a uniformly random length in
/// `[0, max_line_length)`, each byte uniform over [`ALPHABET`], terminated
/// by a newline. Random lengths matter: fixed-size bursts are trivial for a
/// scanner to fingerprint and skip.
///
/// RFC 4253 reserves lines starting with "SSH-" for the version exchange,
/// so the rare draw that would produce that prefix gets its first byte
/// rewritten.
fn banner_line(max_line_length: u64) -> Vec<u8> {
    let mut rng = thread_rng();
    let length = rng.gen_range(0..max_line_length) as usize;

    let mut line = Vec::with_capacity(length + 1);
    for _ in 0..length {
        line.push(ALPHABET[rng.gen_range(0..ALPHABET.len())]);
    }

    if line.starts_with(b"SSH-") {
        line[0] = b'X';
    }

    line.push(b'\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// An accepted client/server socket pair on the loopback interface.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");

        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client_side, server_side) = tokio::join!(connect, accept);

        (
            server_side.expect("accept").0,
            client_side.expect("connect"),
        )
    }

    #[test]
    fn test_banner_line_format() {
        for _ in 0..1000 {
            let line = banner_line(32);
            assert!(!line.is_empty());
            assert!(line.len() <= 32, "length {} exceeds bound", line.len());
            assert_eq!(*line.last().expect("nonempty"), b'\n');
            assert!(!line.starts_with(b"SSH-"));

            for &b in &line[..line.len() - 1] {
                assert!(ALPHABET.contains(&b), "byte {b:#04x} outside alphabet");
            }
        }
    }

    #[test]
    fn test_banner_line_minimum_length() {
        // max_line_length 1 always draws length 0: a bare newline.
        for _ in 0..50 {
            assert_eq!(banner_line(1), vec![b'\n']);
        }
    }

    #[test]
    fn test_alphabet_size() {
        // The digit run repeats '0', so the byte count sits one above the
        // distinct-character count.
        assert_eq!(ALPHABET.len(), 92);

        let distinct: std::collections::HashSet<u8> = ALPHABET.iter().copied().collect();
        assert_eq!(distinct.len(), 91);
    }

    #[tokio::test]
    async fn test_first_send_is_immediate() {
        let (server, mut peer) = socket_pair().await;
        let live = Arc::new(AtomicI64::new(0));
        let mut client = Client::new(server, Duration::from_secs(5), Arc::clone(&live), 4)
            .await
            .expect("client");

        let before = std::time::Instant::now();
        let written = client.send(8).await.expect("send");
        assert!(written >= 1);
        assert!(
            before.elapsed() < Duration::from_millis(200),
            "first send must not wait out the interval",
        );

        let mut buf = [0u8; 64];
        let read = peer.read(&mut buf).await.expect("read");
        assert_eq!(read, written);
        assert_eq!(client.bytes_sent(), written as u64);

        client.close();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pacing_lower_bound() {
        let (server, _peer) = socket_pair().await;
        let live = Arc::new(AtomicI64::new(0));
        let interval = Duration::from_millis(200);
        let mut client = Client::new(server, interval, live, 4).await.expect("client");

        client.send(8).await.expect("first send");

        let before = std::time::Instant::now();
        client.send(8).await.expect("second send");
        assert!(
            before.elapsed() >= Duration::from_millis(180),
            "second send arrived {}ms after the first, under the interval",
            before.elapsed().as_millis(),
        );
    }

    #[tokio::test]
    async fn test_new_parks_until_slot_frees() {
        let (s1, _p1) = socket_pair().await;
        let (s2, _p2) = socket_pair().await;
        let live = Arc::new(AtomicI64::new(0));
        let interval = Duration::from_millis(50);

        let first = Client::new(s1, interval, Arc::clone(&live), 1)
            .await
            .expect("first client");

        let pending = tokio::spawn(Client::new(s2, interval, Arc::clone(&live), 1));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!pending.is_finished(), "second client should be parked");

        first.close();
        let second = pending.await.expect("join").expect("second client");
        second.close();
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_milliseconds_since_last_moves_the_mark() {
        let (server, _peer) = socket_pair().await;
        let live = Arc::new(AtomicI64::new(0));
        let mut client = Client::new(server, Duration::from_millis(10), live, 4)
            .await
            .expect("client");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = client.milliseconds_since_last();
        assert!(first >= 40, "first={first}");

        let second = client.milliseconds_since_last();
        assert!(second <= 10, "second={second}");
    }

    #[tokio::test]
    async fn test_accessors() {
        let (server, peer) = socket_pair().await;
        let expected_port = peer.peer_addr().expect("peer addr").port().to_string();

        let live = Arc::new(AtomicI64::new(0));
        let client = Client::new(server, Duration::from_millis(10), live, 4)
            .await
            .expect("client");

        assert_eq!(client.remote_ip(), "127.0.0.1");
        assert_eq!(client.local_port(), expected_port);
    }
}
