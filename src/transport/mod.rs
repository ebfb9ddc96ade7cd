//! Socket transport: one framed TCP connection per [`SocketTransport`],
//! the lazy [`ResponseStream`] for multi-frame replies, and the scratch
//! [`BufferPool`] shared by a node's connections.

pub mod buffer;
pub mod socket;
pub mod stream;

pub use buffer::{BufferPool, PooledBuffer};
pub use socket::{open_frame_stream, open_message_stream, SocketTransport};
pub use stream::{Decoder, ResponseStream};
