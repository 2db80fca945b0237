//! Client-side mirror of the service.
//!
//! The proxy connects to the service socket, writes one framed
//! [`StreamQosRequest`] and waits for the framed reply. In-process helpers
//! and the test suite use it; external clients in other languages implement
//! the same exchange.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::proto::{self, DetdMessage, FrameError, StreamQosRequest};

/// Why a proxied request did not produce a successful admission.
#[derive(Debug)]
pub enum ProxyError {
    /// Connecting, writing or reading the socket failed
    Io(io::Error),
    /// The reply violated the frame protocol
    Frame(FrameError),
    /// The reply frame did not carry a response message
    NotAResponse,
    /// The service answered `ok=false`
    RequestFailed {
        /// Server-provided reason, possibly empty
        reason: String,
    },
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(error) => write!(f, "i/o: {}", error),
            ProxyError::Frame(error) => write!(f, "framing: {}", error),
            ProxyError::NotAResponse => write!(f, "reply did not carry a response"),
            ProxyError::RequestFailed { reason } => {
                if reason.is_empty() {
                    write!(f, "the service rejected the request")
                } else {
                    write!(f, "the service rejected the request: {}", reason)
                }
            }
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(error: io::Error) -> Self {
        ProxyError::Io(error)
    }
}

/// A client of the admission service.
///
/// # Examples
///
/// ```rust,no_run
/// use detd::Proxy;
/// use detd::proto::StreamQosRequest;
///
/// # async fn example() -> Result<(), detd::proxy::ProxyError> {
/// let proxy = Proxy::new("/var/run/detd/detd_service.sock");
/// let request = StreamQosRequest {
///     interface: "eth0".to_string(),
///     period: 2_000_000,
///     size: 1522,
///     dmac: "ab:cd:ef:01:02:03".to_string(),
///     vid: 3,
///     pcp: 6,
///     txmin: 250_000,
///     talker: true,
///     ..Default::default()
/// };
/// let (vlan_interface, socket_priority) = proxy.add_talker(request).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Proxy {
    socket_path: PathBuf,
}

impl Proxy {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Proxy {
            socket_path: socket_path.into(),
        }
    }

    /// Requests admission of a talker stream.
    ///
    /// Returns the VLAN sub-interface to transmit on and the socket
    /// priority to stamp on the traffic.
    pub async fn add_talker(
        &self,
        request: StreamQosRequest,
    ) -> Result<(String, u32), ProxyError> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let frame = proto::encode_frame(&DetdMessage::request(request));
        stream.write_all(&frame).await?;

        let reply = read_reply(&mut stream).await?;
        let response = reply.into_response().ok_or(ProxyError::NotAResponse)?;
        if !response.ok {
            return Err(ProxyError::RequestFailed {
                reason: response.reason,
            });
        }
        Ok((response.vlan_interface, response.socket_priority))
    }
}

async fn read_reply(stream: &mut UnixStream) -> Result<DetdMessage, ProxyError> {
    use prost::Message;

    let mut header = [0u8; proto::FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header);
    proto::check_frame_length(length, DEFAULT_MAX_FRAME_BYTES).map_err(ProxyError::Frame)?;

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;
    DetdMessage::decode(payload.as_slice())
        .map_err(|e| ProxyError::Frame(FrameError::Decode(e)))
}
