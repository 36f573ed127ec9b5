//! Cluster protocol: command set, fixed-width request header and response envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Width of the plaintext command header. Any payload starts right after it.
pub const PLAIN_SIZE: usize = 100;

/// Reason used when `force_sync` arrives without one.
pub const DEFAULT_FORCE_REASON: &str = "Master required";

/// Every command a node accepts. One command per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Identity query.
    Node,
    /// Client pushes its files to the master; the payload is a compressed archive.
    MasterClientSync,
    /// Peer reports the status of its files.
    FileStatus,
    /// Master asks the client to push now.
    ForceSync { reason: String },
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Node => "node",
            Command::MasterClientSync => "m_c_sync",
            Command::FileStatus => "file_status",
            Command::ForceSync { .. } => "force_sync",
        }
    }

    /// Build a command from its name and header arguments.
    pub fn parse(name: &str, args: &[&str]) -> Result<Self, ProtocolError> {
        match name {
            "node" => Ok(Command::Node),
            "m_c_sync" => Ok(Command::MasterClientSync),
            "file_status" => Ok(Command::FileStatus),
            "force_sync" => {
                let reason = if args.is_empty() {
                    DEFAULT_FORCE_REASON.to_string()
                } else {
                    args.join(" ")
                };
                Ok(Command::ForceSync { reason })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Whether the reply is sent as raw bytes instead of a JSON envelope.
    pub fn binary_response(&self) -> bool {
        matches!(self, Command::MasterClientSync)
    }

    fn args(&self) -> Vec<&str> {
        match self {
            Command::ForceSync { reason } => reason.split_whitespace().collect(),
            _ => Vec::new(),
        }
    }
}

/// Split a decrypted message into command name, arguments and payload.
/// The header is the first [`PLAIN_SIZE`] bytes (or the whole message if shorter).
pub fn split_header(plaintext: &[u8]) -> Result<(String, Vec<String>, &[u8]), ProtocolError> {
    let cut = plaintext.len().min(PLAIN_SIZE);
    let (header, payload) = plaintext.split_at(cut);
    let header = std::str::from_utf8(header).map_err(|_| ProtocolError::MalformedHeader)?;
    let mut tokens = header.split_whitespace();
    let command = tokens.next().ok_or(ProtocolError::EmptyHeader)?.to_string();
    let args = tokens.map(str::to_string).collect();
    Ok((command, args, payload))
}

/// A decoded request: the command plus whatever followed the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Plaintext form: header padded with spaces (or cut) to [`PLAIN_SIZE`], then payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = std::iter::once(self.command.name())
            .chain(self.command.args())
            .collect::<Vec<_>>()
            .join(" ");
        if header.len() > PLAIN_SIZE {
            let mut end = PLAIN_SIZE;
            while !header.is_char_boundary(end) {
                end -= 1;
            }
            header.truncate(end);
        }
        let mut out = Vec::with_capacity(PLAIN_SIZE + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.resize(PLAIN_SIZE, b' ');
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(plaintext: &[u8]) -> Result<Self, ProtocolError> {
        let (name, args, payload) = split_header(plaintext)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let command = Command::parse(&name, &args)?;
        Ok(Self {
            command,
            payload: payload.to_vec(),
        })
    }
}

/// Structured reply: `error` is 0 on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub error: i32,
    pub data: Value,
}

/// What goes back to the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Json(Envelope),
    Binary(Vec<u8>),
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Response::Json(Envelope { error: 0, data })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Json(Envelope {
            error: 1,
            data: Value::String(message.into()),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Response::Json(envelope) => Ok(serde_json::to_vec(envelope)?),
            Response::Binary(bytes) => Ok(bytes.clone()),
        }
    }

    /// Decode a reply to a request for `command`. Binary commands may still get an
    /// envelope back when the remote side failed.
    pub fn decode(command: &Command, bytes: Vec<u8>) -> Result<Self, ProtocolError> {
        match serde_json::from_slice::<Envelope>(&bytes) {
            Ok(envelope) => Ok(Response::Json(envelope)),
            Err(_) if command.binary_response() => Ok(Response::Binary(bytes)),
            Err(e) => Err(ProtocolError::Json(e)),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Json(Envelope { error, .. }) if *error != 0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid command {0:?}")]
    UnknownCommand(String),
    #[error("command header is not valid UTF-8")]
    MalformedHeader,
    #[error("empty command header")]
    EmptyHeader,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
