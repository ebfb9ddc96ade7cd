use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DriverError, DriverResult};

/// Message codes the transport core itself speaks. Every other tag is opaque
/// to this crate and belongs to the request/response layer above it.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    ErrorResp = 0,
    PingReq = 1,
    PingResp = 2,
    SetClientIdReq = 5,
    SetClientIdResp = 6,
}

impl MessageCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ErrorResp),
            1 => Some(Self::PingReq),
            2 => Some(Self::PingResp),
            5 => Some(Self::SetClientIdReq),
            6 => Some(Self::SetClientIdResp),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// A typed payload bound to one message tag.
pub trait Message: Sized + Send {
    const TAG: u8;

    fn to_payload(&self) -> DriverResult<Vec<u8>>;

    fn from_payload(payload: &[u8]) -> DriverResult<Self>;
}

/// Body of the reserved error frame: `[code: u32 BE][message: UTF-8]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}

impl ErrorResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.message.len());
        buf.put_u32(self.code);
        buf.put_slice(self.message.as_bytes());
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> DriverResult<Self> {
        if payload.len() < 4 {
            return Err(DriverError::communication(format!(
                "Error frame payload is {} bytes, expected at least 4",
                payload.len()
            )));
        }
        let code = payload.get_u32();
        let message = String::from_utf8_lossy(payload).into_owned();
        Ok(Self { code, message })
    }
}

impl From<ErrorResponse> for DriverError {
    fn from(resp: ErrorResponse) -> Self {
        DriverError::Server {
            code: resp.code,
            message: resp.message,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingRequest;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingResponse;

impl Message for PingRequest {
    const TAG: u8 = MessageCode::PingReq as u8;

    fn to_payload(&self) -> DriverResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn from_payload(_payload: &[u8]) -> DriverResult<Self> {
        Ok(PingRequest)
    }
}

impl Message for PingResponse {
    const TAG: u8 = MessageCode::PingResp as u8;

    fn to_payload(&self) -> DriverResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn from_payload(_payload: &[u8]) -> DriverResult<Self> {
        Ok(PingResponse)
    }
}

/// Per-checkout identity exchange; the payload is the raw client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetClientIdRequest {
    pub client_id: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetClientIdResponse;

impl Message for SetClientIdRequest {
    const TAG: u8 = MessageCode::SetClientIdReq as u8;

    fn to_payload(&self) -> DriverResult<Vec<u8>> {
        Ok(self.client_id.to_vec())
    }

    fn from_payload(payload: &[u8]) -> DriverResult<Self> {
        Ok(Self {
            client_id: Bytes::copy_from_slice(payload),
        })
    }
}

impl Message for SetClientIdResponse {
    const TAG: u8 = MessageCode::SetClientIdResp as u8;

    fn to_payload(&self) -> DriverResult<Vec<u8>> {
        Ok(Vec::new())
    }

    fn from_payload(_payload: &[u8]) -> DriverResult<Self> {
        Ok(SetClientIdResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_codes() {
        assert_eq!(MessageCode::from_u8(0), Some(MessageCode::ErrorResp));
        assert_eq!(MessageCode::from_u8(6), Some(MessageCode::SetClientIdResp));
        assert_eq!(MessageCode::from_u8(9), None);
        assert_eq!(MessageCode::PingResp.tag(), 2);
        assert_eq!(PingRequest::TAG, 1);
    }

    #[test]
    fn test_error_response_layout() {
        let resp = ErrorResponse {
            code: 0x01020304,
            message: "no such bucket".to_string(),
        };
        let bytes = resp.encode();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..], b"no such bucket");
        assert_eq!(ErrorResponse::decode(&bytes).unwrap(), resp);
    }

    #[test]
    fn test_error_response_empty_message() {
        let resp = ErrorResponse::decode(&[0, 0, 0, 9]).unwrap();
        assert_eq!(resp.code, 9);
        assert!(resp.message.is_empty());
    }

    #[test]
    fn test_error_response_truncated() {
        let err = ErrorResponse::decode(&[0, 1]).unwrap_err();
        assert!(err.node_offline());
    }

    #[test]
    fn test_error_response_into_driver_error() {
        let err: DriverError = ErrorResponse {
            code: 7,
            message: "busy".into(),
        }
        .into();
        assert!(matches!(err, DriverError::Server { code: 7, .. }));
        assert!(!err.node_offline());
    }
}
