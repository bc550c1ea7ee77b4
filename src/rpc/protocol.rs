use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::codec::LengthDelimitedCodec;

use crate::lease::{LeaseError, RangeGrant, Submission};

/// Largest frame either side accepts (a full bloom shard is well under this)
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Monitor to leader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    AcquireRange { agent_id: String },
    SubmitResults(Submission),
}

/// Leader to monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Granted(RangeGrant),
    Submitted,
    Rejected(LeaseError),
}

/// Errors on the monitor side of the RPC boundary
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Could not reach leader at {addr} within {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("Leader closed the connection")]
    Closed,
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Remote(#[from] LeaseError),
}

impl RpcError {
    /// The leader answered with a structured lease error
    pub fn as_lease_error(&self) -> Option<&LeaseError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, RpcError> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stopset::StopSetSnapshot;
    use bytes::BytesMut;
    use std::net::Ipv4Addr;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_frame_roundtrip() {
        let response = Response::Granted(RangeGrant {
            range_id: 2,
            addresses: vec![Ipv4Addr::new(198, 51, 100, 1)],
            stops: StopSetSnapshot::Exact {
                keys: vec!["10.0.0.1-198.51.100.1".into()],
            },
        });

        let mut codec = codec();
        let mut buf = BytesMut::new();
        codec.encode(encode(&response).unwrap(), &mut buf).unwrap();
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        let decoded: Response = decode(&frame).unwrap();
        assert_eq!(decoded, response);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rejection_wire_shape() {
        let json = serde_json::to_string(&Response::Rejected(LeaseError::LeaseExpired { range_id: 1 })).unwrap();
        assert_eq!(json, r#"{"rejected":{"kind":"lease_expired","range_id":1}}"#);
    }

    #[test]
    fn test_garbage_frame_is_codec_error() {
        let err = decode::<Request>(b"{not json").unwrap_err();
        assert!(matches!(err, RpcError::Codec(_)));
    }
}
