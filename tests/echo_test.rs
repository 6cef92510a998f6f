//! End-to-end tests over real UDP sockets on loopback.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use arq_tokio::{ArqConfig, ArqListener, ArqStream};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

async fn bind_listener(config: &ArqConfig) -> (ArqListener, SocketAddr) {
    let listener = ArqListener::bind("127.0.0.1:0".parse().unwrap(), config.clone())
        .await
        .expect("bind listener");
    let addr = listener.local_addr();
    (listener, addr)
}

#[tokio::test]
async fn message_echo() {
    init_tracing();
    let config = ArqConfig::new().fast_mode();
    let (mut listener, addr) = bind_listener(&config).await;

    let server = tokio::spawn(async move {
        let mut stream = listener.accept().await.expect("accept");
        while let Some(msg) = stream.recv().await {
            stream.send(&msg).await.expect("echo send");
        }
    });

    let mut client = ArqStream::connect(addr, config).await.expect("connect");
    client.send(b"ping").await.expect("send");

    let reply = timeout(Duration::from_secs(10), client.recv())
        .await
        .expect("echo within deadline")
        .expect("stream still open");
    assert_eq!(&reply[..], b"ping");

    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn large_message_echo() {
    init_tracing();
    let config = ArqConfig::new().fast_mode().window_size(256, 256);
    let (mut listener, addr) = bind_listener(&config).await;

    let server = tokio::spawn(async move {
        let mut stream = listener.accept().await.expect("accept");
        while let Some(msg) = stream.recv().await {
            stream.send(&msg).await.expect("echo send");
        }
    });

    let mut client = ArqStream::connect(addr, config).await.expect("connect");
    let message: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 256) as u8).collect();
    client.send(&message).await.expect("send");

    let reply = timeout(Duration::from_secs(30), client.recv())
        .await
        .expect("echo within deadline")
        .expect("stream still open");
    assert_eq!(reply.len(), message.len());
    assert_eq!(&reply[..], &message[..]);

    let stats = client.stats().await.expect("stats");
    assert!(stats.bytes_sent >= message.len() as u64);

    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn messages_preserve_order_and_boundaries() {
    init_tracing();
    let config = ArqConfig::new().fast_mode();
    let (mut listener, addr) = bind_listener(&config).await;

    let server = tokio::spawn(async move {
        let mut stream = listener.accept().await.expect("accept");
        while let Some(msg) = stream.recv().await {
            stream.send(&msg).await.expect("echo send");
        }
    });

    let mut client = ArqStream::connect(addr, config).await.expect("connect");
    for i in 0..32u32 {
        let body = format!("message number {i}");
        client.send(body.as_bytes()).await.expect("send");
    }
    for i in 0..32u32 {
        let reply = timeout(Duration::from_secs(10), client.recv())
            .await
            .expect("echo within deadline")
            .expect("stream still open");
        assert_eq!(&reply[..], format!("message number {i}").as_bytes());
    }

    client.close().await.expect("close");
    server.abort();
}

#[tokio::test]
async fn two_clients_are_demultiplexed() {
    init_tracing();
    let config = ArqConfig::new().fast_mode();
    let (mut listener, addr) = bind_listener(&config).await;

    let server = tokio::spawn(async move {
        loop {
            let mut stream = match listener.accept().await {
                Ok(stream) => stream,
                Err(_) => return,
            };
            tokio::spawn(async move {
                while let Some(msg) = stream.recv().await {
                    let mut reply = msg.to_vec();
                    reply.extend_from_slice(format!(" via {}", stream.conv()).as_bytes());
                    if stream.send(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let mut first = ArqStream::connect(addr, config.clone()).await.expect("connect");
    let mut second = ArqStream::connect(addr, config).await.expect("connect");
    assert_ne!(first.conv(), second.conv());

    first.send(b"alpha").await.expect("send");
    second.send(b"beta").await.expect("send");

    let reply_one = timeout(Duration::from_secs(10), first.recv())
        .await
        .expect("deadline")
        .expect("open");
    let reply_two = timeout(Duration::from_secs(10), second.recv())
        .await
        .expect("deadline")
        .expect("open");

    assert_eq!(&reply_one[..], format!("alpha via {}", first.conv()).as_bytes());
    assert_eq!(&reply_two[..], format!("beta via {}", second.conv()).as_bytes());

    server.abort();
}

#[tokio::test]
async fn async_io_byte_pipe() {
    init_tracing();
    let config = ArqConfig::new().fast_mode().stream(true);
    let (mut listener, addr) = bind_listener(&config).await;

    let server = tokio::spawn(async move {
        let mut stream = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 8 * 1024];
        stream.read_exact(&mut buf).await.expect("read_exact");
        stream.write_all(&buf).await.expect("write_all");
        stream.flush().await.expect("flush");
        // Hold the connection open until the peer has read everything.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let mut client = ArqStream::connect(addr, config).await.expect("connect");
    let payload: Vec<u8> = (0..8 * 1024u32).map(|i| (i * 7 % 251) as u8).collect();
    client.write_all(&payload).await.expect("write_all");
    client.flush().await.expect("flush");

    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(20), client.read_exact(&mut echoed))
        .await
        .expect("deadline")
        .expect("read_exact");
    assert_eq!(echoed, payload);

    server.abort();
}
