//! Loopback servers for unit tests

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::protocol::encode_frame;

/// Answers every request frame with an empty frame tagged `tag + 1`.
pub(crate) async fn responder() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut header = [0u8; 5];
                while socket.read_exact(&mut header).await.is_ok() {
                    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
                    let mut body = vec![0u8; len as usize - 1];
                    if socket.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    let mut out = BytesMut::new();
                    encode_frame(header[4] + 1, &[], &mut out).unwrap();
                    if socket.write_all(&out).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// A port nothing listens on.
pub(crate) async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
