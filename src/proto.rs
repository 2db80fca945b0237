//! Wire protocol: length-prefixed protobuf frames.
//!
//! Clients and service exchange *frames*: a 4-byte big-endian payload length
//! followed by that many bytes of protobuf-encoded [`DetdMessage`]. A frame
//! with a zero length, or one longer than the configured cap, terminates the
//! connection without a response.
//!
//! The message structs are hand-written prost types; the frame header is
//! parsed with nom so buffer-based callers (tests, embedders) can decode
//! without an async reader.

use nom_derive::{Nom, Parse};

use std::fmt;

/// A talker admission request as it travels on the wire.
///
/// `txmin` is the authoritative transmission offset; `txmax`, when non-zero,
/// must equal `txmin` plus the frame's transmission duration. `talker` must
/// be true and `setup_socket` false in the current scope; `maddress` and the
/// `hints_*` fields are carried for wire compatibility and ignored for
/// talkers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamQosRequest {
    #[prost(string, tag = "1")]
    pub interface: String,
    /// Cycle interval in nanoseconds
    #[prost(uint32, tag = "2")]
    pub period: u32,
    /// Frame size in bytes, headers included
    #[prost(uint32, tag = "3")]
    pub size: u32,
    /// Destination MAC, `XX:XX:XX:XX:XX:XX`
    #[prost(string, tag = "4")]
    pub dmac: String,
    #[prost(uint32, tag = "5")]
    pub vid: u32,
    #[prost(uint32, tag = "6")]
    pub pcp: u32,
    /// Transmission offset within the cycle, nanoseconds
    #[prost(uint32, tag = "7")]
    pub txmin: u32,
    /// Upper bound of the transmit window, nanoseconds
    #[prost(uint32, tag = "8")]
    pub txmax: u32,
    #[prost(bool, tag = "9")]
    pub setup_socket: bool,
    /// Explicit schedule start; zero means "compute from the cycle"
    #[prost(uint32, tag = "10")]
    pub basetime: u32,
    #[prost(bool, tag = "11")]
    pub talker: bool,
    /// Multicast address for listener setups, unused for talkers
    #[prost(string, tag = "12")]
    pub maddress: String,
    #[prost(bool, tag = "13")]
    pub hints_launch_time: bool,
    #[prost(bool, tag = "14")]
    pub hints_preemption: bool,
}

/// The service's answer to a [`StreamQosRequest`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamQosResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    /// VLAN sub-interface to transmit on, e.g. `eth0.3`
    #[prost(string, tag = "2")]
    pub vlan_interface: String,
    /// Socket priority selecting the stream's gated queue, 0-15
    #[prost(uint32, tag = "3")]
    pub socket_priority: u32,
    /// Failure reason, empty on success
    #[prost(string, tag = "4")]
    pub reason: String,
}

/// Envelope carried in every frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DetdMessage {
    #[prost(oneof = "detd_message::Payload", tags = "1, 2")]
    pub payload: Option<detd_message::Payload>,
}

pub mod detd_message {
    /// The message kinds a frame can carry.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        StreamQosRequest(super::StreamQosRequest),
        #[prost(message, tag = "2")]
        StreamQosResponse(super::StreamQosResponse),
    }
}

impl DetdMessage {
    pub fn request(request: StreamQosRequest) -> Self {
        DetdMessage {
            payload: Some(detd_message::Payload::StreamQosRequest(request)),
        }
    }

    pub fn response(response: StreamQosResponse) -> Self {
        DetdMessage {
            payload: Some(detd_message::Payload::StreamQosResponse(response)),
        }
    }

    pub fn into_request(self) -> Option<StreamQosRequest> {
        match self.payload {
            Some(detd_message::Payload::StreamQosRequest(request)) => Some(request),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<StreamQosResponse> {
        match self.payload {
            Some(detd_message::Payload::StreamQosResponse(response)) => Some(response),
            _ => None,
        }
    }
}

/// Length prefix preceding every protobuf payload.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Nom)]
struct FrameHeader {
    length: u32,
}

/// Why a frame could not be decoded. Per protocol, none of these produce a
/// response; the connection is dropped.
#[derive(Debug, Clone)]
pub enum FrameError {
    /// Zero-length frames are not allowed
    Empty,
    /// Declared length exceeds the configured cap
    Oversize { length: u32, cap: usize },
    /// Fewer bytes available than the header or length prefix announced
    Truncated { expected: usize, available: usize },
    /// Payload was not a valid message
    Decode(prost::DecodeError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Empty => write!(f, "zero-length frame"),
            FrameError::Oversize { length, cap } => {
                write!(f, "frame of {} bytes exceeds the {} byte cap", length, cap)
            }
            FrameError::Truncated {
                expected,
                available,
            } => {
                write!(
                    f,
                    "truncated frame: expected {} bytes, {} available",
                    expected, available
                )
            }
            FrameError::Decode(error) => write!(f, "undecodable payload: {}", error),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encodes one message as a length-prefixed frame.
pub fn encode_frame(message: &DetdMessage) -> Vec<u8> {
    use bytes::BufMut;
    use prost::Message;

    let payload = message.encode_to_vec();
    let mut buf = bytes::BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    buf.to_vec()
}

/// Decodes one frame from the front of `input`.
///
/// Returns the message and the bytes following the frame.
pub fn decode_frame(input: &[u8], cap: usize) -> Result<(DetdMessage, &[u8]), FrameError> {
    use prost::Message;

    let (rest, header) = FrameHeader::parse(input).map_err(|_| FrameError::Truncated {
        expected: FRAME_HEADER_LEN,
        available: input.len(),
    })?;
    check_frame_length(header.length, cap)?;
    let length = header.length as usize;
    if rest.len() < length {
        return Err(FrameError::Truncated {
            expected: length,
            available: rest.len(),
        });
    }
    let (payload, remaining) = rest.split_at(length);
    let message = DetdMessage::decode(payload).map_err(FrameError::Decode)?;
    Ok((message, remaining))
}

/// Validates a length prefix against the protocol rules.
pub fn check_frame_length(length: u32, cap: usize) -> Result<(), FrameError> {
    if length == 0 {
        return Err(FrameError::Empty);
    }
    if length as usize > cap {
        return Err(FrameError::Oversize { length, cap });
    }
    Ok(())
}
