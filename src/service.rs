//! Unix-domain socket intake.
//!
//! The service accepts connections on a `SOCK_STREAM` Unix socket and speaks
//! the frame protocol of [`crate::proto`]: one request frame in, one
//! response frame out, then the connection closes. A semaphore bounds how
//! many connections are served in parallel (one by default); admissions run
//! on blocking threads so the accept loop never stalls behind an effector
//! transaction.
//!
//! Framing violations drop the connection without a response. Admission
//! failures of any kind answer `ok=false` with the reason and leave the
//! service running.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::manager::{Manager, TalkerRequest};
use crate::proto::{self, DetdMessage, FrameError, StreamQosResponse};

/// The admission service.
pub struct Service {
    config: ServiceConfig,
    manager: Arc<Manager>,
}

impl Service {
    pub fn new(config: ServiceConfig, manager: Arc<Manager>) -> Self {
        Service { config, manager }
    }

    /// Binds the socket and serves connections until the task is dropped.
    pub async fn run(&self) -> io::Result<()> {
        let listener = self.bind()?;
        log::info!(
            "listening on {} ({} parallel connection(s))",
            self.config.socket_path.display(),
            self.config.max_connections
        );

        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let (stream, _addr) = listener.accept().await?;
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                // Closed semaphore means the service is shutting down
                Err(_) => return Ok(()),
            };
            let manager = self.manager.clone();
            let max_frame = self.config.max_frame_bytes;
            tokio::spawn(async move {
                if let Err(error) = serve_connection(stream, manager, max_frame).await {
                    log::debug!("connection closed: {}", error);
                }
                drop(permit);
            });
        }
    }

    fn bind(&self) -> io::Result<UnixListener> {
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A stale socket from a previous run would fail the bind
        match std::fs::remove_file(&self.config.socket_path) {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => return Err(error),
        }
        let listener = UnixListener::bind(&self.config.socket_path)?;
        std::fs::set_permissions(
            &self.config.socket_path,
            std::fs::Permissions::from_mode(0o660),
        )?;
        Ok(listener)
    }
}

/// Why a connection ended without a response.
#[derive(Debug)]
enum ConnectionError {
    Io(io::Error),
    Frame(FrameError),
    /// The frame decoded but did not carry a request
    NotARequest,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(error) => write!(f, "i/o: {}", error),
            ConnectionError::Frame(error) => write!(f, "framing: {}", error),
            ConnectionError::NotARequest => write!(f, "frame did not carry a request"),
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        ConnectionError::Io(error)
    }
}

async fn serve_connection(
    mut stream: UnixStream,
    manager: Arc<Manager>,
    max_frame: usize,
) -> Result<(), ConnectionError> {
    let message = read_frame(&mut stream, max_frame).await?;
    let request = message.into_request().ok_or(ConnectionError::NotARequest)?;

    let response = match TalkerRequest::try_from(&request) {
        Ok(talker) => {
            // The admission may shell out under the interface lock; keep it
            // off the async workers. A client that disconnects meanwhile
            // does not abort it: the transaction completes or rolls back
            // and only the response is discarded.
            let outcome = match tokio::task::spawn_blocking(move || manager.add_talker(&talker))
                .await
            {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    log::error!("admission task died: {}", join_error);
                    let frame = proto::encode_frame(&DetdMessage::response(failure_response(
                        "internal error".to_string(),
                    )));
                    stream.write_all(&frame).await?;
                    stream.shutdown().await?;
                    return Ok(());
                }
            };
            match outcome {
                Ok(admission) => StreamQosResponse {
                    ok: true,
                    vlan_interface: admission.vlan_interface,
                    socket_priority: u32::from(admission.socket_priority),
                    reason: String::new(),
                },
                Err(error) => {
                    log::info!("admission rejected: {}", error);
                    failure_response(error.to_string())
                }
            }
        }
        Err(error) => {
            log::info!("request rejected: {}", error);
            failure_response(error.to_string())
        }
    };

    let frame = proto::encode_frame(&DetdMessage::response(response));
    stream.write_all(&frame).await?;
    stream.shutdown().await?;
    Ok(())
}

fn failure_response(reason: String) -> StreamQosResponse {
    StreamQosResponse {
        ok: false,
        vlan_interface: String::new(),
        socket_priority: 0,
        reason,
    }
}

/// Reads one length-prefixed frame from the stream.
async fn read_frame(
    stream: &mut UnixStream,
    max_frame: usize,
) -> Result<DetdMessage, ConnectionError> {
    use prost::Message;

    let mut header = [0u8; proto::FRAME_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let length = u32::from_be_bytes(header);
    proto::check_frame_length(length, max_frame).map_err(ConnectionError::Frame)?;

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;
    DetdMessage::decode(payload.as_slice())
        .map_err(|e| ConnectionError::Frame(FrameError::Decode(e)))
}
