//! Boundary codec between transport frames and typed messages.
//!
//! # Frame Mapping
//!
//! - `output`: binary frame carrying the raw chunk
//! - `exit`: text frame `{"type":"exit","exitCode":0,"signal":null}`
//! - `input`: text frame `{"type":"input","data":"..."}`, or a binary frame
//!   carrying raw bytes
//! - `resize`: text frame `{"type":"resize","cols":80,"rows":30}`
//!
//! Text frames are validated here, before anything reaches a session:
//! malformed JSON, an unknown `type`, or a missing field all produce a typed
//! [`ProtocolError`].

use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::messages::{ClientMessage, ExitInfo, ServerMessage, TerminalSize, TextMessage};

/// A transport frame, independent of the underlying WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A UTF-8 text frame.
    Text(String),
    /// A binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// Frame kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }
}

/// Decode a frame received by the server.
pub fn decode_client(frame: Frame) -> Result<ClientMessage> {
    match frame {
        Frame::Binary(data) => Ok(ClientMessage::Input(data)),
        Frame::Text(text) => match parse_text(&text)? {
            TextMessage::Input { data } => Ok(ClientMessage::Input(data.into_bytes())),
            TextMessage::Resize { cols, rows } => {
                Ok(ClientMessage::Resize(TerminalSize::new(cols, rows)))
            }
            TextMessage::Exit { .. } => Err(ProtocolError::UnexpectedFrame("exit")),
        },
    }
}

/// Encode a message sent by the server.
pub fn encode_server(message: ServerMessage) -> Result<Frame> {
    match message {
        ServerMessage::Output(data) => Ok(Frame::Binary(data)),
        ServerMessage::Exit(info) => to_text(&TextMessage::Exit {
            exit_code: info.exit_code,
            signal: info.signal,
        }),
    }
}

/// Encode a message sent by the client.
///
/// Input that is valid UTF-8 travels as a JSON text frame; anything else is
/// sent as a binary frame so no byte is lost.
pub fn encode_client(message: ClientMessage) -> Result<Frame> {
    match message {
        ClientMessage::Input(data) => match String::from_utf8(data) {
            Ok(data) => to_text(&TextMessage::Input { data }),
            Err(err) => Ok(Frame::Binary(err.into_bytes())),
        },
        ClientMessage::Resize(size) => to_text(&TextMessage::Resize {
            cols: size.cols,
            rows: size.rows,
        }),
    }
}

/// Decode a frame received by the client.
pub fn decode_server(frame: Frame) -> Result<ServerMessage> {
    match frame {
        Frame::Binary(data) => Ok(ServerMessage::Output(data)),
        Frame::Text(text) => match parse_text(&text)? {
            TextMessage::Exit { exit_code, signal } => {
                Ok(ServerMessage::Exit(ExitInfo { exit_code, signal }))
            }
            TextMessage::Input { .. } => Err(ProtocolError::UnexpectedFrame("input")),
            TextMessage::Resize { .. } => Err(ProtocolError::UnexpectedFrame("resize")),
        },
    }
}

fn parse_text(text: &str) -> Result<TextMessage> {
    let value: Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !matches!(kind.as_str(), "input" | "resize" | "exit") {
        return Err(ProtocolError::UnknownMessageType(kind));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidField {
        kind,
        reason: e.to_string(),
    })
}

fn to_text(message: &TextMessage) -> Result<Frame> {
    serde_json::to_string(message)
        .map(Frame::Text)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}
