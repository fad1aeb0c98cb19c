// Broadcast output over real TCP connections

use std::time::Duration;

use flightbox::output::{BroadcastConfig, BroadcastServer};
use flightbox::{ContentType, Coordinator, HubConfig, Item, LifecycleConfig};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

fn lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        settle_delay: Duration::ZERO,
        producer_stop_timeout: Duration::from_millis(500),
        consumer_grace: Duration::from_secs(2),
    }
}

async fn start_server(content_types: &[&str]) -> (Coordinator, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = BroadcastServer::with_listener(
        "broadcast-0",
        BroadcastConfig {
            content_types: content_types.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        listener,
    );
    let mut coordinator = Coordinator::new(HubConfig::default(), lifecycle());
    coordinator.start(vec![Box::new(server)]).await.unwrap();
    (coordinator, addr)
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half),
            writer,
        };
        // The reply proves the server has registered this connection
        let listing = client.command("list_clients").await;
        assert!(listing.starts_with('#'), "{listing:?}");
        client
    }

    async fn command(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        self.read_line().await
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("no line from server")
            .unwrap();
        line
    }

    async fn expect_eof(&mut self) {
        let mut rest = Vec::new();
        let n = tokio::time::timeout(READ_TIMEOUT, self.reader.read_to_end(&mut rest))
            .await
            .expect("connection stayed open")
            .unwrap();
        assert_eq!(n, 0, "unexpected bytes {rest:?}");
    }
}

#[tokio::test]
async fn test_items_reach_every_client() {
    let (coordinator, addr) = start_server(&["nmea"]).await;
    let mut first = TestClient::connect(addr).await;
    let mut second = TestClient::connect(addr).await;

    let listing = second.command("list_clients").await;
    assert!(listing.contains("#1 ") && listing.contains(", #2 "), "{listing:?}");
    assert!(listing.ends_with("\r\n"));

    coordinator
        .hub()
        .publish(Item::text(ContentType::Nmea, "$GPGGA,1*00"))
        .await
        .unwrap();
    assert_eq!(first.read_line().await, "$GPGGA,1*00\r\n");
    assert_eq!(second.read_line().await, "$GPGGA,1*00\r\n");

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribed_types_are_not_sent() {
    let (coordinator, addr) = start_server(&["flarm"]).await;
    let mut client = TestClient::connect(addr).await;

    let hub = coordinator.hub().clone();
    hub.publish(Item::text(ContentType::Nmea, "$GPGGA,1*00"))
        .await
        .unwrap();
    hub.publish(Item::new(ContentType::Flarm, vec![0x46, 0x42, 0x01, b'\n']))
        .await
        .unwrap();

    let mut frame = [0u8; 4];
    tokio::time::timeout(READ_TIMEOUT, client.reader.read_exact(&mut frame))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, [0x46, 0x42, 0x01, b'\n']);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_echo_and_exit() {
    let (coordinator, addr) = start_server(&["ANY"]).await;
    let mut client = TestClient::connect(addr).await;

    assert_eq!(client.command("hello").await, "hello\n");
    client.writer.write_all(b"exit\n").await.unwrap();
    client.expect_eof().await;

    let report = coordinator.shutdown().await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_shutdown_closes_client_connections() {
    let (coordinator, addr) = start_server(&["ANY"]).await;
    let mut client = TestClient::connect(addr).await;

    let report = coordinator.shutdown().await;
    assert!(report.is_clean(), "{report:?}");
    client.expect_eof().await;
}

#[tokio::test]
async fn test_long_command_line_is_echoed_in_pieces() {
    let (coordinator, addr) = start_server(&["ANY"]).await;
    let mut client = TestClient::connect(addr).await;

    // Longer than one command read; the pieces come back in order
    let long = "a".repeat(5_000);
    assert_eq!(client.command(&long).await, format!("{long}\n"));
    assert!(client.command("list_clients").await.starts_with("#1 "));

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_queued_items_are_flushed_before_close() {
    const ITEMS: usize = 100;
    let (coordinator, addr) = start_server(&["nmea"]).await;
    let mut client = TestClient::connect(addr).await;

    for i in 0..ITEMS {
        coordinator
            .hub()
            .publish(Item::text(ContentType::Nmea, format!("$GPTXT,{i}*00")))
            .await
            .unwrap();
    }
    let report = coordinator.shutdown().await;
    assert!(report.is_clean(), "{report:?}");

    for i in 0..ITEMS {
        assert_eq!(client.read_line().await, format!("$GPTXT,{i}*00\r\n"));
    }
    client.expect_eof().await;
}
