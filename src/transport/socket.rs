use std::borrow::BorrowMut;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::buffer::BufferPool;
use super::stream::ResponseStream;
use crate::cluster::config::NodeConfig;
use crate::error::{DriverError, DriverResult};
use crate::protocol::{
    decode_header, encode_frame, ErrorResponse, Frame, Message, MessageCode, PingRequest,
    PingResponse, SetClientIdRequest, SetClientIdResponse, HEADER_LEN,
};

/// One TCP connection to a node, speaking the framed protocol.
///
/// The socket is opened lazily by the first write and reopened whenever it
/// has been idle longer than the node's idle timeout. Any I/O failure,
/// timeout or protocol violation closes it; the next write reconnects.
///
/// Idleness is judged from the last successful exchange only. A peer that
/// half-closed the connection while we sat idle is noticed on the next read.
pub struct SocketTransport {
    config: Arc<NodeConfig>,
    stream: Option<TcpStream>,
    last_activity: Instant,
    /// Set while an I/O call is in flight; still set if its future was dropped
    poisoned: bool,
    buffers: Arc<BufferPool>,
}

impl SocketTransport {
    pub fn new(config: Arc<NodeConfig>, buffers: Arc<BufferPool>) -> Self {
        Self {
            config,
            stream: None,
            last_activity: Instant::now(),
            poisoned: false,
            buffers,
        }
    }

    pub fn address(&self) -> String {
        self.config.address()
    }

    /// Socket open and used within the idle timeout.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.idle_time() <= self.config.idle_timeout()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// An exchange was interrupted half-way; the socket cannot be reused.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub async fn connect(&mut self) -> DriverResult<()> {
        self.disconnect();

        let addr = self.config.address();
        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DriverError::io(&format!("Failed to connect to {}", addr), e));
            }
            Err(_) => return Err(DriverError::timeout(&format!("Connect to {}", addr))),
        };

        stream
            .set_nodelay(true)
            .map_err(|e| DriverError::io("Failed to set TCP_NODELAY", e))?;

        tracing::debug!("Connected to {}", addr);
        self.stream = Some(stream);
        self.last_activity = Instant::now();
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Closed connection to {}", self.config.address());
        }
        self.poisoned = false;
    }

    async fn ensure_connected(&mut self) -> DriverResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.stream.is_some() {
            tracing::debug!(
                "Connection to {} idle for {:?}, reconnecting",
                self.config.address(),
                self.idle_time()
            );
        }
        self.connect().await
    }

    /// Send one frame, reconnecting first if needed.
    pub async fn write_frame(&mut self, tag: u8, payload: &[u8]) -> DriverResult<()> {
        let mut buf = self.buffers.checkout();
        encode_frame(tag, payload, &mut buf).map_err(|e| match e {
            DriverError::MessageTooLarge(n) => {
                DriverError::InvalidRequest(format!("Request frame of {} bytes is too large", n))
            }
            other => other,
        })?;

        self.ensure_connected().await?;

        let timeout = self.config.write_timeout();
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(DriverError::communication("Not connected")),
        };

        self.poisoned = true;
        let result = tokio::time::timeout(timeout, async {
            stream.write_all(&buf[..]).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.poisoned = false;
                self.last_activity = Instant::now();
                tracing::trace!("Sent frame tag={} len={}", tag, payload.len() + 1);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!("Write to {} failed: {}", self.config.address(), e);
                self.disconnect();
                Err(DriverError::io("Write failed", e))
            }
            Err(_) => {
                tracing::warn!("Write to {} timed out", self.config.address());
                self.disconnect();
                Err(DriverError::timeout("Write"))
            }
        }
    }

    /// Read one frame with the given tag and decode its payload in place.
    ///
    /// An error frame is always turned into [`DriverError::Server`] and leaves
    /// the socket open, whatever tag was expected. A frame with any other
    /// unexpected tag closes it.
    pub async fn read_with<R>(
        &mut self,
        expected_tag: u8,
        decode: impl FnOnce(u8, &[u8]) -> DriverResult<R>,
    ) -> DriverResult<R> {
        let mut header = [0u8; HEADER_LEN];
        self.read_exact_timed(&mut header, "Read header").await?;

        let (tag, payload_len) = match decode_header(&header) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Bad frame header from {}: {}", self.config.address(), e);
                self.disconnect();
                return Err(e);
            }
        };

        let mut buf = self.buffers.checkout();
        buf.resize(payload_len, 0);
        self.read_exact_timed(&mut buf[..], "Read payload").await?;
        self.last_activity = Instant::now();
        tracing::trace!("Received frame tag={} len={}", tag, payload_len + 1);

        if tag == MessageCode::ErrorResp.tag() {
            return match ErrorResponse::decode(&buf[..]) {
                Ok(resp) => Err(resp.into()),
                Err(e) => {
                    self.disconnect();
                    Err(e)
                }
            };
        }

        if tag != expected_tag {
            tracing::warn!(
                "Unexpected message from {}: expected tag {}, got {}",
                self.config.address(),
                expected_tag,
                tag
            );
            self.disconnect();
            return Err(DriverError::UnexpectedMessage {
                expected: expected_tag,
                actual: tag,
            });
        }

        decode(tag, &buf[..])
    }

    pub async fn read_frame(&mut self, expected_tag: u8) -> DriverResult<Frame> {
        self.read_with(expected_tag, |tag, payload| {
            Ok(Frame::new(tag, Bytes::copy_from_slice(payload)))
        })
        .await
    }

    pub async fn write_message<M: Message + Sync>(&mut self, message: &M) -> DriverResult<()> {
        let payload = message.to_payload()?;
        self.write_frame(M::TAG, &payload).await
    }

    pub async fn read_message<M: Message>(&mut self) -> DriverResult<M> {
        self.read_with(M::TAG, |_, payload| M::from_payload(payload))
            .await
    }

    /// Write a frame and stream back responses until `keep_going` says stop.
    pub async fn open_frames<P>(
        &mut self,
        tag: u8,
        payload: &[u8],
        expected_tag: u8,
        keep_going: P,
    ) -> DriverResult<ResponseStream<Frame, &mut Self>>
    where
        P: FnMut(&Frame) -> bool + Send + 'static,
    {
        open_frame_stream(self, tag, payload, expected_tag, keep_going).await
    }

    /// Single request/response round trip on raw frames.
    pub async fn request_frame(
        &mut self,
        tag: u8,
        payload: &[u8],
        expected_tag: u8,
    ) -> DriverResult<Frame> {
        let mut responses = self
            .open_frames(tag, payload, expected_tag, |_| false)
            .await?;
        first_response(responses.next().await)
    }

    /// Single typed request/response round trip.
    pub async fn request<Req, Resp>(&mut self, request: &Req) -> DriverResult<Resp>
    where
        Req: Message + Sync,
        Resp: Message + 'static,
    {
        let mut responses = open_message_stream::<_, Req, Resp, _>(self, request, |_| false).await?;
        first_response(responses.next().await)
    }

    pub async fn ping(&mut self) -> DriverResult<()> {
        let _: PingResponse = self.request(&PingRequest).await?;
        Ok(())
    }

    pub async fn set_client_id(&mut self, client_id: &Bytes) -> DriverResult<()> {
        let request = SetClientIdRequest {
            client_id: client_id.clone(),
        };
        let _: SetClientIdResponse = self.request(&request).await?;
        Ok(())
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8], what: &str) -> DriverResult<()> {
        let timeout = self.config.read_timeout();
        let stream = match self.stream.as_mut() {
            Some(stream) => stream,
            None => return Err(DriverError::communication("Not connected")),
        };

        self.poisoned = true;
        let result = tokio::time::timeout(timeout, stream.read_exact(buf)).await;

        match result {
            Ok(Ok(_)) => {
                self.poisoned = false;
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!("{} from {} failed: {}", what, self.config.address(), e);
                self.disconnect();
                Err(DriverError::io(&format!("{} failed", what), e))
            }
            Err(_) => {
                tracing::warn!("{} from {} timed out", what, self.config.address());
                self.disconnect();
                Err(DriverError::timeout(what))
            }
        }
    }
}

/// Write a raw frame on `conn` and hand back the lazy response sequence.
///
/// `conn` may be a borrowed transport or an owned pool checkout; in the
/// latter case the connection stays checked out until the stream ends.
pub async fn open_frame_stream<C, P>(
    mut conn: C,
    tag: u8,
    payload: &[u8],
    expected_tag: u8,
    keep_going: P,
) -> DriverResult<ResponseStream<Frame, C>>
where
    C: BorrowMut<SocketTransport>,
    P: FnMut(&Frame) -> bool + Send + 'static,
{
    check_expected_tag(expected_tag)?;
    let transport: &mut SocketTransport = conn.borrow_mut();
    transport.write_frame(tag, payload).await?;
    Ok(ResponseStream::new(
        conn,
        expected_tag,
        |tag, payload| Ok(Frame::new(tag, Bytes::copy_from_slice(payload))),
        keep_going,
    ))
}

/// Typed counterpart of [`open_frame_stream`].
pub async fn open_message_stream<C, Req, Resp, P>(
    mut conn: C,
    request: &Req,
    keep_going: P,
) -> DriverResult<ResponseStream<Resp, C>>
where
    C: BorrowMut<SocketTransport>,
    Req: Message + Sync,
    Resp: Message + 'static,
    P: FnMut(&Resp) -> bool + Send + 'static,
{
    let transport: &mut SocketTransport = conn.borrow_mut();
    transport.write_message(request).await?;
    Ok(ResponseStream::new(
        conn,
        Resp::TAG,
        |_, payload| Resp::from_payload(payload),
        keep_going,
    ))
}

/// The error tag is reserved and can never be awaited as a reply.
fn check_expected_tag(expected_tag: u8) -> DriverResult<()> {
    if expected_tag == MessageCode::ErrorResp.tag() {
        return Err(DriverError::InvalidRequest(format!(
            "Tag {} is reserved for error frames",
            expected_tag
        )));
    }
    Ok(())
}

fn first_response<M>(item: Option<DriverResult<M>>) -> DriverResult<M> {
    item.unwrap_or_else(|| Err(DriverError::communication("Response stream ended early")))
}
