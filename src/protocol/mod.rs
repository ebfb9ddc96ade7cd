//! Wire protocol definitions
//!
//! Every message on the wire is one frame:
//! - **Length**: 4 bytes BE, counting the tag byte plus the payload
//! - **Tag**: 1 byte message code
//! - **Payload**: `length - 1` opaque bytes
//!
//! Tag 0 is reserved for server errors; its payload is
//! `[code: 4 bytes BE][UTF-8 message]`.

pub mod codec;
pub mod message;

pub use codec::{
    decode_frame, decode_header, decode_msgpack, encode_frame, encode_msgpack, Frame, HEADER_LEN,
    MAX_FRAME_SIZE,
};
pub use message::{
    ErrorResponse, Message, MessageCode, PingRequest, PingResponse, SetClientIdRequest,
    SetClientIdResponse,
};
