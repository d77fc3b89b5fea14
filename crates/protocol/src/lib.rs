//! # PtyBridge Protocol Library
//!
//! This crate defines the messages exchanged between a browser terminal and
//! the PtyBridge daemon, and the codec that maps them onto transport frames.
//!
//! ## Overview
//!
//! ```text
//! ┌───────────────┐   input / resize    ┌───────────────┐
//! │   terminal    │ ──────────────────▶ │    daemon     │
//! │   emulator    │ ◀────────────────── │ (shell + PTY) │
//! └───────────────┘   output / exit     └───────────────┘
//! ```
//!
//! Output travels as binary frames so arbitrary control sequences survive
//! untouched; control messages travel as tagged JSON text frames.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{decode_client, Frame, ClientMessage, TerminalSize};
//!
//! let frame = Frame::Text(r#"{"type":"resize","cols":100,"rows":40}"#.to_string());
//! let message = decode_client(frame).unwrap();
//! assert_eq!(message, ClientMessage::Resize(TerminalSize::new(100, 40)));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Message definitions and fixed session constants
//! - [`codec`]: Frame encoding and boundary validation
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{decode_client, decode_server, encode_client, encode_server, Frame};
pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, ExitInfo, ServerMessage, TerminalSize, DEFAULT_COLS, DEFAULT_ROWS, TERM_NAME,
    TERMINAL_PATH,
};
