//! End-to-end tests over real sockets.
//!
//! These drive a full engine instance with a raw TCP client speaking the
//! wire protocol by hand: handshake bytes, masked client frames, and the
//! close handshake, against both engine forms.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration};

use tokamak_protocol::{CloseReason, Packet, Token, TokenCodec};
use token_server::engine::connector::Connector;
use token_server::{
    AcceptPolicy, BroadcastOptions, ConnectorRegistry, DispatchSettings, EngineHooks,
    EngineSettings, PluginVerdict, ReactorEngine, ServerError, SpawnEngine, TokenPlugin,
    TokenServer,
};

fn test_settings(port: u16) -> EngineSettings {
    EngineSettings {
        listen_addr: format!("127.0.0.1:{port}"),
        connect_timeout_ms: 2_000,
        send_timeout_ms: 2_000,
        ..Default::default()
    }
}

async fn connect(port: u16) -> TcpStream {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("server on port {port} never came up");
}

/// Performs a modern handshake and returns the response head.
async fn modern_handshake(stream: &mut TcpStream) -> String {
    let request = "GET /tokamak HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Origin: http://client.example.com\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed during handshake");
        response.extend_from_slice(&byte[..n]);
    }
    String::from_utf8(response).unwrap()
}

/// Builds a masked client text frame.
fn masked_text_frame(payload: &[u8]) -> Vec<u8> {
    let key = [0x37, 0xFA, 0x21, 0x3D];
    let mut frame = vec![0x81];
    if payload.len() < 126 {
        frame.push(0x80 | payload.len() as u8);
    } else {
        frame.push(0x80 | 126);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    }
    frame.extend_from_slice(&key);
    frame.extend(
        payload
            .iter()
            .enumerate()
            .map(|(i, byte)| byte ^ key[i % 4]),
    );
    frame
}

/// Reads one unmasked server frame, returning (opcode, payload).
async fn read_server_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.unwrap();
    let opcode = header[0] & 0x0F;
    let mut len = (header[1] & 0x7F) as usize;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).await.unwrap();
        len = u16::from_be_bytes(ext) as usize;
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (opcode, payload)
}

/// Echoes every `say` token back to its sender.
struct EchoPlugin;

#[async_trait]
impl TokenPlugin for EchoPlugin {
    fn id(&self) -> &str {
        "echo"
    }
    fn namespace(&self) -> &str {
        "tokamak.echo"
    }
    async fn process_token(
        &self,
        server: &TokenServer,
        connector: &Arc<dyn Connector>,
        token: &Token,
    ) -> Result<PluginVerdict, ServerError> {
        let mut response = token.response();
        if let Some(text) = token.get_string("text") {
            response.set_string("text", text);
        }
        server.send_token(None, connector, &response).await?;
        Ok(PluginVerdict::Abort)
    }
}

fn token_stack() -> (Arc<ConnectorRegistry>, Arc<TokenServer>) {
    let registry = Arc::new(ConnectorRegistry::new());
    let server = TokenServer::new(registry.clone(), &DispatchSettings::default(), None);
    server.add_plugin(Arc::new(EchoPlugin));
    (registry, server)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_spawn_engine_modern_echo_round_trip() {
    let port = 19801;
    let (registry, server) = token_stack();
    let engine = Arc::new(SpawnEngine::new(
        test_settings(port),
        registry,
        server.clone() as Arc<dyn EngineHooks>,
    ));
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    let mut client = connect(port).await;
    let response = modern_handshake(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
    assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    assert!(response.contains("Set-Cookie: sid="));

    let request = br#"{"ns":"tokamak.echo","type":"say","utid":"1","text":"hello"}"#;
    client.write_all(&masked_text_frame(request)).await.unwrap();

    let (opcode, payload) = timeout(Duration::from_secs(2), read_server_frame(&mut client))
        .await
        .unwrap();
    assert_eq!(opcode, 0x1);
    let token = tokamak_protocol::JsonTokenCodec::new().decode(&payload).unwrap();
    assert_eq!(token.namespace, "tokamak.echo");
    assert_eq!(token.token_type, "response");
    assert_eq!(token.get_string("reqType"), Some("say"));
    assert_eq!(token.get_string("text"), Some("hello"));
    assert_eq!(token.id.as_deref(), Some("1"));

    // Close handshake: the server echoes our CLOSE.
    let close = {
        let key = [1, 2, 3, 4];
        let payload = [0x03, 0xE8u8]; // 1000
        let mut frame = vec![0x88, 0x80 | 2];
        frame.extend_from_slice(&key);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        frame
    };
    client.write_all(&close).await.unwrap();
    let (opcode, payload) = timeout(Duration::from_secs(2), read_server_frame(&mut client))
        .await
        .unwrap();
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, vec![0x03, 0xE8]);

    engine.shutdown();
    let _ = runner.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reactor_engine_preserves_message_order() {
    let port = 19802;
    let (registry, server) = token_stack();
    let engine = Arc::new(ReactorEngine::new(
        test_settings(port),
        registry,
        server.clone() as Arc<dyn EngineHooks>,
    ));
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    let mut client = connect(port).await;
    modern_handshake(&mut client).await;

    // A burst of queued messages from one peer must come back in order.
    for i in 0..20 {
        let request =
            format!(r#"{{"ns":"tokamak.echo","type":"say","text":"msg-{i}"}}"#);
        client
            .write_all(&masked_text_frame(request.as_bytes()))
            .await
            .unwrap();
    }

    let codec = tokamak_protocol::JsonTokenCodec::new();
    for i in 0..20 {
        let (opcode, payload) = timeout(Duration::from_secs(2), read_server_frame(&mut client))
            .await
            .unwrap();
        assert_eq!(opcode, 0x1);
        let token = codec.decode(&payload).unwrap();
        assert_eq!(token.get_string("text"), Some(format!("msg-{i}").as_str()));
    }

    engine.shutdown();
    let _ = runner.await;
}

/// Hooks that collect raw packets, bypassing the token layer.
struct PacketSink {
    packets: Mutex<Vec<Packet>>,
}

#[async_trait]
impl EngineHooks for PacketSink {
    async fn engine_started(&self) {}
    async fn engine_stopped(&self) {}
    async fn connector_started(&self, _connector: Arc<dyn Connector>) {}
    async fn connector_stopped(&self, _connector: Arc<dyn Connector>, _reason: CloseReason) {}
    async fn packet_received(&self, _connector: Arc<dyn Connector>, packet: Packet) {
        self.packets.lock().await.push(packet);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_legacy_framed_bytes_deliver_one_text_packet() {
    let port = 19803;
    let sink = Arc::new(PacketSink {
        packets: Mutex::new(Vec::new()),
    });
    let engine = Arc::new(SpawnEngine::new(
        test_settings(port),
        Arc::new(ConnectorRegistry::new()),
        sink.clone() as Arc<dyn EngineHooks>,
    ));
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    let mut client = connect(port).await;
    // Legacy era: no Sec-WebSocket-Key.
    let request = "GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nOrigin: http://o\r\n\r\n";
    client.write_all(request.as_bytes()).await.unwrap();
    let mut head = [0u8; 43];
    client.read_exact(&mut head).await.unwrap();
    assert!(std::str::from_utf8(&head)
        .unwrap()
        .starts_with("HTTP/1.1 101 WebSocket Protocol Handshake"));

    client.write_all(&[0x00, b'h', b'i', 0xFF]).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        {
            let packets = sink.packets.lock().await;
            if !packets.is_empty() {
                assert_eq!(packets.len(), 1);
                assert_eq!(packets[0].as_text(), Some("hi"));
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "no packet arrived");
        sleep(Duration::from_millis(10)).await;
    }

    engine.shutdown();
    let _ = runner.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reject_policy_closes_with_reason_after_handshake() {
    let port = 19804;
    let (registry, server) = token_stack();
    let mut settings = test_settings(port);
    settings.max_connections = 0;
    settings.accept_policy = AcceptPolicy::Reject;
    let engine = Arc::new(SpawnEngine::new(
        settings,
        registry,
        server.clone() as Arc<dyn EngineHooks>,
    ));
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    let mut client = connect(port).await;
    let response = modern_handshake(&mut client).await;
    assert!(response.starts_with("HTTP/1.1 101"));

    // The over-cap connector says goodbye with a reject close.
    let (opcode, payload) = timeout(Duration::from_secs(2), read_server_frame(&mut client))
        .await
        .unwrap();
    assert_eq!(opcode, 0x8);
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());
    assert_eq!(&payload[2..], b"reject");

    engine.shutdown();
    let _ = runner.await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_reaches_other_clients_not_sender() {
    let port = 19805;
    let (registry, server) = token_stack();
    let engine = Arc::new(SpawnEngine::new(
        test_settings(port),
        registry.clone(),
        server.clone() as Arc<dyn EngineHooks>,
    ));
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    let mut sender = connect(port).await;
    modern_handshake(&mut sender).await;
    let mut receiver = connect(port).await;
    modern_handshake(&mut receiver).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while registry.up_connectors().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline);
        sleep(Duration::from_millis(10)).await;
    }

    // Broadcast from the first connector's identity.
    let connectors = registry.up_connectors();
    let mut token = Token::new("tokamak.echo", "announce");
    token.set_string("text", "to everyone else");
    let delivered = server
        .broadcast_token(Some(&connectors[0]), &token, BroadcastOptions::default())
        .await;
    assert_eq!(delivered, 1);

    engine.shutdown();
    let _ = runner.await;
}
