//! TCP client for the collaboration server.
//!
//! One background reader task turns the byte stream back into
//! [`ClientEvent`]s delivered over a channel; one writer task owns the
//! socket's write half. The client remembers the user id from the first
//! successful login, so session requests only need the caller's intent.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::protocol::{Cursor, Incoming, MessageKind, ProtocolError, Request};

#[derive(Debug)]
pub enum ClientError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// A session request was issued before any successful login.
    NotAuthenticated,
    /// The connection's background tasks have exited.
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "client I/O error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::NotAuthenticated => write!(f, "not logged in"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Messages surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// A reply or error addressed to this client.
    Reply(crate::protocol::Response),
    /// A write/erase echo broadcast to the session.
    Edit(Request),
    /// The server closed the connection or the stream failed.
    Disconnected,
}

/// Connection to one collaboration server.
pub struct CollabClient {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: Option<mpsc::UnboundedReceiver<ClientEvent>>,
    user_id: Arc<Mutex<Option<String>>>,
}

impl CollabClient {
    pub async fn connect(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (event_tx, events) = mpsc::unbounded_channel();
        let user_id = Arc::new(Mutex::new(None));

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, event_tx, user_id.clone()));

        Ok(Self {
            outbound,
            events: Some(events),
            user_id,
        })
    }

    /// The event stream. Yields `None` once per client; intended for a
    /// single consumer loop.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.take()
    }

    /// User id captured from the last successful login, if any.
    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn register(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.send(&Request::Register {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn login(&self, username: &str, password: &str) -> Result<(), ClientError> {
        self.send(&Request::Login {
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn create(&self, filename: &str) -> Result<(), ClientError> {
        let user_id = self.require_user()?;
        self.send(&Request::Create {
            user_id,
            filename: filename.into(),
        })
    }

    pub fn load(&self, filename: &str) -> Result<(), ClientError> {
        let user_id = self.require_user()?;
        self.send(&Request::Load {
            user_id,
            filename: filename.into(),
        })
    }

    pub fn join(&self, access_code: &str) -> Result<(), ClientError> {
        let user_id = self.require_user()?;
        self.send(&Request::Join {
            user_id,
            access_code: access_code.into(),
        })
    }

    pub fn write(&self, cursor: Cursor, text: &str) -> Result<(), ClientError> {
        let user_id = self.require_user()?;
        self.send(&Request::Write {
            user_id,
            cursor,
            text: text.into(),
        })
    }

    pub fn erase(&self, cursor: Cursor, count: u32) -> Result<(), ClientError> {
        let user_id = self.require_user()?;
        self.send(&Request::Erase {
            user_id,
            cursor,
            count,
        })
    }

    /// Send an already-built request as-is.
    pub fn send(&self, request: &Request) -> Result<(), ClientError> {
        let bytes = request.encode()?;
        self.outbound
            .send(bytes)
            .map_err(|_| ClientError::Closed)
    }

    fn require_user(&self) -> Result<String, ClientError> {
        self.user_id().ok_or(ClientError::NotAuthenticated)
    }
}

async fn write_loop(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            log::warn!("Client write failed: {e}");
            return;
        }
    }
}

async fn read_loop(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    events: mpsc::UnboundedSender<ClientEvent>,
    user_id: Arc<Mutex<Option<String>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                let _ = events.send(ClientEvent::Disconnected);
                return;
            }
            Ok(n) => n,
            Err(e) => {
                log::warn!("Client read failed: {e}");
                let _ = events.send(ClientEvent::Disconnected);
                return;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match Incoming::decode_prefix(&buf) {
                Ok((incoming, used)) => {
                    buf.drain(..used);
                    let event = match incoming {
                        Incoming::Reply(response) => {
                            if response.kind == MessageKind::Login && !response.is_error() {
                                if let Some(id) = response.fields.first() {
                                    *user_id
                                        .lock()
                                        .unwrap_or_else(std::sync::PoisonError::into_inner) =
                                        Some(id.clone());
                                }
                            }
                            ClientEvent::Reply(response)
                        }
                        Incoming::Edit(request) => ClientEvent::Edit(request),
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Err(ProtocolError::Truncated) => break,
                Err(e) => {
                    log::warn!("Undecodable server message: {e}");
                    buf.clear();
                    break;
                }
            }
        }
    }
}
