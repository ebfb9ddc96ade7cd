//! Common test utilities for driver integration tests
//!
//! Provides:
//! - Tracing setup honouring `RUST_LOG`
//! - An in-process mock node speaking the frame protocol
//! - Config builders tuned for fast failure in tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use kvcluster::protocol::{encode_frame, ErrorResponse};
use kvcluster::{ClusterConfig, NodeConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvcluster=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// What the mock node does with one request frame
pub enum Reply {
    /// Write these frames back, in order
    Frames(Vec<(u8, Vec<u8>)>),
    /// Close the connection without answering
    Disconnect,
}

pub type Handler = Arc<dyn Fn(u8, &[u8]) -> Reply + Send + Sync>;

/// `t -> t + 1` with the request payload echoed back.
pub fn echo(tag: u8, payload: &[u8]) -> Reply {
    Reply::Frames(vec![(tag + 1, payload.to_vec())])
}

pub fn error_frame(code: u32, message: &str) -> (u8, Vec<u8>) {
    let resp = ErrorResponse {
        code,
        message: message.to_string(),
    };
    (0, resp.encode().to_vec())
}

/// `count` frames tagged `tag`, payload `[index, done]`; `done` is 1 on the last.
pub fn streamed(tag: u8, count: u8) -> Vec<(u8, Vec<u8>)> {
    (1..=count)
        .map(|i| (tag, vec![i, u8::from(i == count)]))
        .collect()
}

pub struct MockNode {
    pub port: u16,
    requests: Arc<AtomicUsize>,
    connections: Arc<AtomicUsize>,
    down: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl MockNode {
    pub async fn echo() -> Self {
        Self::with_handler(Arc::new(echo)).await
    }

    pub async fn with_handler(handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(AtomicUsize::new(0));
        let connections = Arc::new(AtomicUsize::new(0));
        let down = Arc::new(AtomicBool::new(false));

        let accept_task = {
            let requests = requests.clone();
            let connections = connections.clone();
            let down = down.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        socket,
                        handler.clone(),
                        requests.clone(),
                        down.clone(),
                    ));
                }
            })
        };

        Self {
            port,
            requests,
            connections,
            down,
            accept_task,
        }
    }

    /// Requests received so far, across all connections.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// While down, every request is answered by closing the connection.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn node_config(&self) -> NodeConfig {
        fast_node(self.port)
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    mut socket: TcpStream,
    handler: Handler,
    requests: Arc<AtomicUsize>,
    down: Arc<AtomicBool>,
) {
    let mut header = [0u8; 5];
    loop {
        if socket.read_exact(&mut header).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len.saturating_sub(1)];
        if socket.read_exact(&mut payload).await.is_err() {
            return;
        }
        requests.fetch_add(1, Ordering::SeqCst);

        if down.load(Ordering::SeqCst) {
            return;
        }
        match handler(header[4], &payload) {
            Reply::Frames(frames) => {
                let mut out = BytesMut::new();
                for (tag, body) in frames {
                    encode_frame(tag, &body, &mut out).unwrap();
                }
                if socket.write_all(&out).await.is_err() {
                    return;
                }
            }
            Reply::Disconnect => return,
        }
    }
}

/// Node config with short timeouts so failures surface quickly.
pub fn fast_node(port: u16) -> NodeConfig {
    let mut config = NodeConfig::new("127.0.0.1", port);
    config.connect_timeout_ms = 300;
    config.read_timeout_ms = 1_000;
    config.write_timeout_ms = 1_000;
    config.acquire_timeout_ms = 100;
    config
}

pub fn cluster_config(nodes: Vec<NodeConfig>) -> ClusterConfig {
    let mut config = ClusterConfig::new(nodes);
    config.retry_wait_ms = 10;
    config.node_poll_ms = 50;
    config
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
