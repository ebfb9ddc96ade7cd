//! Lazy response sequences
//!
//! The protocol is half-duplex per connection: after a request is written,
//! every frame up to the last one of the reply must be read before the
//! connection can carry anything else. A [`ResponseStream`] owns (or
//! borrows) the connection for exactly that span. Each `next()` reads one
//! frame; the sequence ends after the first item for which the continuation
//! predicate returns `false`, or after the first error.
//!
//! The completion hook runs exactly once, before the connection is let go,
//! whether the stream finished normally, failed, or was dropped early.
//! Dropping an unfinished stream closes the socket, since unread frames
//! may still be in flight.

use std::borrow::BorrowMut;
use std::fmt;

use futures::stream::{self, Stream};

use super::socket::SocketTransport;
use crate::error::{DriverError, DriverResult};

pub type Decoder<M> = fn(u8, &[u8]) -> DriverResult<M>;

type Predicate<M> = Box<dyn FnMut(&M) -> bool + Send>;
type CompletionHook = Box<dyn FnOnce() + Send>;

pub struct ResponseStream<M, C>
where
    C: BorrowMut<SocketTransport>,
{
    conn: Option<C>,
    expected_tag: u8,
    decode: Decoder<M>,
    keep_going: Predicate<M>,
    on_complete: Option<CompletionHook>,
    yielded: usize,
}

impl<M, C> ResponseStream<M, C>
where
    C: BorrowMut<SocketTransport>,
{
    /// Wrap a connection whose request has already been written.
    pub fn new<P>(conn: C, expected_tag: u8, decode: Decoder<M>, keep_going: P) -> Self
    where
        P: FnMut(&M) -> bool + Send + 'static,
    {
        Self {
            conn: Some(conn),
            expected_tag,
            decode,
            keep_going: Box::new(keep_going),
            on_complete: None,
            yielded: 0,
        }
    }

    /// Register the hook run once the sequence is over.
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_complete = Some(Box::new(hook));
        self
    }

    pub fn is_finished(&self) -> bool {
        self.conn.is_none()
    }

    /// Items handed out so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    pub async fn next(&mut self) -> Option<DriverResult<M>> {
        let conn = self.conn.as_mut()?;
        let transport: &mut SocketTransport = conn.borrow_mut();

        match transport.read_with(self.expected_tag, self.decode).await {
            Ok(item) => {
                self.yielded += 1;
                if !(self.keep_going)(&item) {
                    self.finish();
                }
                Some(Ok(item))
            }
            Err(e) => {
                // A server error frame ends the reply cleanly; anything else
                // leaves unread bytes behind.
                if !matches!(e, DriverError::Server { .. }) {
                    transport.disconnect();
                }
                self.finish();
                Some(Err(e))
            }
        }
    }

    /// Drain the remaining items, stopping at the first error.
    pub async fn collect_all(mut self) -> DriverResult<Vec<M>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = DriverResult<M>> {
        stream::unfold(self, |mut responses| async move {
            responses.next().await.map(|item| (item, responses))
        })
    }

    fn finish(&mut self) {
        if let Some(hook) = self.on_complete.take() {
            hook();
        }
        self.conn = None;
    }
}

impl<M, C> Drop for ResponseStream<M, C>
where
    C: BorrowMut<SocketTransport>,
{
    fn drop(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            tracing::debug!(
                "Response stream dropped after {} items, closing connection",
                self.yielded
            );
            let transport: &mut SocketTransport = conn.borrow_mut();
            transport.disconnect();
            self.finish();
        }
    }
}

impl<M, C> fmt::Debug for ResponseStream<M, C>
where
    C: BorrowMut<SocketTransport>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("expected_tag", &self.expected_tag)
            .field("yielded", &self.yielded)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::NodeConfig;
    use crate::protocol::{encode_frame, ErrorResponse, Frame};
    use crate::transport::buffer::BufferPool;
    use crate::transport::socket::open_frame_stream;
    use bytes::BytesMut;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one connection, swallows the request, then writes `frames`.
    async fn scripted_server(frames: Vec<(u8, Vec<u8>)>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 5];
            socket.read_exact(&mut header).await.unwrap();
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let mut body = vec![0u8; len - 1];
            socket.read_exact(&mut body).await.unwrap();

            let mut out = BytesMut::new();
            for (tag, payload) in frames {
                encode_frame(tag, &payload, &mut out).unwrap();
            }
            socket.write_all(&out).await.unwrap();
            let mut rest = Vec::new();
            let _ = socket.read_to_end(&mut rest).await;
        });
        port
    }

    fn transport(port: u16) -> SocketTransport {
        let mut config = NodeConfig::new("127.0.0.1", port);
        config.read_timeout_ms = 1_000;
        SocketTransport::new(Arc::new(config), BufferPool::new(2))
    }

    #[tokio::test]
    async fn test_stops_when_predicate_false() {
        let port = scripted_server(vec![
            (18, vec![1, 0]),
            (18, vec![2, 0]),
            (18, vec![3, 1]),
        ])
        .await;
        let mut conn = transport(port);
        let completions = Arc::new(AtomicUsize::new(0));
        let hook_count = completions.clone();

        let mut responses = open_frame_stream(&mut conn, 17, &[3], 18, |f: &Frame| f.payload[1] == 0)
            .await
            .unwrap()
            .on_complete(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            });

        let mut seen = Vec::new();
        while let Some(frame) = responses.next().await {
            seen.push(frame.unwrap().payload[0]);
        }
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(responses.is_finished());
        assert!(responses.next().await.is_none());
        drop(responses);

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_error_frame_ends_stream() {
        let error = ErrorResponse {
            code: 3,
            message: "listing aborted".into(),
        };
        let port = scripted_server(vec![(18, vec![1, 0]), (0, error.encode().to_vec())]).await;
        let mut conn = transport(port);
        let completions = Arc::new(AtomicUsize::new(0));
        let hook_count = completions.clone();

        let responses = open_frame_stream(&mut conn, 17, &[], 18, |_| true)
            .await
            .unwrap()
            .on_complete(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            });

        let err = responses.collect_all().await.unwrap_err();
        assert!(matches!(err, DriverError::Server { code: 3, .. }));
        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_unexpected_tag_closes_connection() {
        let port = scripted_server(vec![(18, vec![1, 0]), (40, vec![])]).await;
        let mut conn = transport(port);

        let mut responses = open_frame_stream(&mut conn, 17, &[], 18, |_| true)
            .await
            .unwrap();
        assert!(responses.next().await.unwrap().is_ok());
        let err = responses.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            DriverError::UnexpectedMessage {
                expected: 18,
                actual: 40
            }
        ));
        assert!(responses.next().await.is_none());
        drop(responses);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_early_drop_runs_hook_and_closes() {
        let port = scripted_server(vec![(18, vec![1, 0]), (18, vec![2, 0]), (18, vec![3, 1])]).await;
        let mut conn = transport(port);
        let completions = Arc::new(AtomicUsize::new(0));
        let hook_count = completions.clone();

        let mut responses = open_frame_stream(&mut conn, 17, &[], 18, |f: &Frame| f.payload[1] == 0)
            .await
            .unwrap()
            .on_complete(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            });
        assert!(responses.next().await.unwrap().is_ok());
        drop(responses);

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let port = scripted_server(vec![(18, vec![1, 0]), (18, vec![2, 1])]).await;
        let mut conn = transport(port);

        let responses = open_frame_stream(&mut conn, 17, &[], 18, |f: &Frame| f.payload[1] == 0)
            .await
            .unwrap();
        let items: Vec<_> = responses.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|r| r.is_ok()));
    }
}
