use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use endlessh::config::Config;
use endlessh::server::Server;

fn base_config() -> Config {
    let mut cfg = Config {
        host: "127.0.0.1".to_string(),
        ports: vec![0],
        interval: Duration::from_millis(100),
        line_length: 8,
        max_clients: 16,
        ..Default::default()
    };
    cfg.prometheus.host = "127.0.0.1".to_string();
    cfg.prometheus.port = 0;
    cfg
}

async fn started(cfg: Config) -> Server {
    cfg.validate().expect("valid test config");
    let mut server = Server::new(cfg).expect("server");
    server.start().await.expect("start");
    server
}

/// Read one burst, or None on timeout/EOF.
async fn read_burst(stream: &mut TcpStream, wait: Duration) -> Option<Vec<u8>> {
    let mut buf = [0u8; 256];
    match timeout(wait, stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => Some(buf[..n].to_vec()),
        _ => None,
    }
}

#[tokio::test]
async fn single_client_is_paced() {
    let mut cfg = base_config();
    cfg.interval = Duration::from_millis(500);
    let server = started(cfg).await;

    let mut conn = TcpStream::connect(server.local_addrs()[0])
        .await
        .expect("connect");

    // The first burst arrives immediately, not an interval later.
    let first = read_burst(&mut conn, Duration::from_millis(200))
        .await
        .expect("first burst within 200ms");
    assert!(first.len() <= 8);
    assert_eq!(*first.last().expect("nonempty"), b'\n');
    assert!(!first.starts_with(b"SSH-"));

    // Nothing more inside the pacing interval...
    assert!(
        read_burst(&mut conn, Duration::from_millis(200)).await.is_none(),
        "burst arrived inside the pacing interval",
    );

    // ...but the next line shows up once the interval elapses.
    assert!(
        read_burst(&mut conn, Duration::from_millis(700)).await.is_some(),
        "no burst after the pacing interval",
    );
}

#[tokio::test]
async fn every_port_serves_bursts() {
    let mut cfg = base_config();
    cfg.ports = vec![0, 0, 0];
    let server = started(cfg).await;

    assert_eq!(server.local_addrs().len(), 3);

    for addr in server.local_addrs() {
        let mut conn = TcpStream::connect(addr).await.expect("connect");

        // Scanners usually lead with their own banner; it must be ignored.
        conn.write_all(b"SSH-2.0-OpenSSH_8.2p1\r\n")
            .await
            .expect("client banner");

        let burst = read_burst(&mut conn, Duration::from_secs(1))
            .await
            .unwrap_or_else(|| panic!("no burst from {addr}"));
        assert_eq!(*burst.last().expect("nonempty"), b'\n');
    }
}

#[tokio::test]
async fn ceiling_parks_excess_clients() {
    let mut cfg = base_config();
    cfg.max_clients = 2;
    let server = started(cfg).await;
    let addr = server.local_addrs()[0];

    let mut first = TcpStream::connect(addr).await.expect("connect");
    let mut second = TcpStream::connect(addr).await.expect("connect");
    let mut third = TcpStream::connect(addr).await.expect("connect");

    assert!(
        read_burst(&mut first, Duration::from_secs(1)).await.is_some(),
        "first client starved",
    );
    assert!(
        read_burst(&mut second, Duration::from_secs(1)).await.is_some(),
        "second client starved",
    );

    // The third connection is accepted at the TCP level but parked; no
    // bytes flow while both slots are taken.
    assert!(
        read_burst(&mut third, Duration::from_millis(600)).await.is_none(),
        "client got bytes past the ceiling",
    );

    // Once a trapped client leaves, its slot frees up and the parked one
    // starts receiving.
    drop(first);
    assert!(
        read_burst(&mut third, Duration::from_secs(5)).await.is_some(),
        "parked client never got a slot",
    );
}

#[tokio::test]
async fn counters_track_opens_and_closes() {
    let mut cfg = base_config();
    cfg.prometheus.enabled = true;
    let server = started(cfg).await;
    let addr = server.local_addrs()[0];
    let port = addr.port().to_string();

    let connected_at = Instant::now();
    let mut conn = TcpStream::connect(addr).await.expect("connect");
    read_burst(&mut conn, Duration::from_secs(1))
        .await
        .expect("first burst");

    let metrics = server.metrics().expect("metrics enabled");

    // The open is recorded shortly after the connection lands.
    wait_for(Duration::from_secs(5), || {
        metrics.opens_total.with_label_values(&[&port]).get() == 1.0
    })
    .await;

    // Closing the connection is noticed on the next paced write.
    drop(conn);
    wait_for(Duration::from_secs(5), || {
        metrics.closes_total.with_label_values(&[&port]).get() == 1.0
    })
    .await;

    // Trapped time roughly matches the observed lifetime.
    let lifetime = connected_at.elapsed().as_secs_f64();
    let trapped = metrics
        .trapped_seconds_total
        .with_label_values(&[&port])
        .get();
    assert!(
        trapped > 0.0 && trapped <= lifetime + 0.5,
        "trapped={trapped}, lifetime={lifetime}",
    );

    let text = metrics.render().expect("render");
    assert!(text.contains("endlessh_client_open_count{"));
    assert!(text.contains("ip=\"127.0.0.1\""));
}

/// Poll `condition` until it holds or the deadline passes.
async fn wait_for<F: Fn() -> bool>(deadline: Duration, condition: F) {
    let start = Instant::now();
    while !condition() {
        assert!(
            start.elapsed() < deadline,
            "condition not met within {deadline:?}",
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
