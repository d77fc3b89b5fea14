//! Message definitions for the terminal bridge.
//!
//! Four logical messages cross the transport: `output` and `exit` flow from
//! the server to the client, `input` and `resize` flow from the client to the
//! server. Disconnect is implicit in the transport closing.

use serde::{Deserialize, Serialize};

/// Well-known path the terminal transport is served on.
pub const TERMINAL_PATH: &str = "/api/terminal";

/// Initial terminal width for every spawned shell.
pub const DEFAULT_COLS: u16 = 80;

/// Initial terminal height for every spawned shell.
pub const DEFAULT_ROWS: u16 = 30;

/// Terminal type advertised to spawned shells through `TERM`.
pub const TERM_NAME: &str = "xterm-color";

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    /// Number of columns.
    pub cols: u16,
    /// Number of rows.
    pub rows: u16,
}

impl TerminalSize {
    /// Create a new terminal size.
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

/// How a shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitInfo {
    /// Numeric exit code reported by the OS.
    pub exit_code: i32,
    /// Terminating signal number, if a signal ended the process.
    pub signal: Option<i32>,
}

impl ExitInfo {
    /// A normal exit with the given code.
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: None,
        }
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Raw bytes destined for the shell's standard input.
    Input(Vec<u8>),
    /// New terminal geometry.
    Resize(TerminalSize),
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// One chunk of raw shell output, exactly as read from the PTY.
    Output(Vec<u8>),
    /// The shell process ended. Sent at most once per session.
    Exit(ExitInfo),
}

/// JSON shape of text frames. The `type` tag selects the variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum TextMessage {
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        signal: Option<i32>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_size() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 30);
    }

    #[test]
    fn test_exit_info_json_shape() {
        let json = serde_json::to_string(&ExitInfo::code(0)).unwrap();
        assert_eq!(json, r#"{"exitCode":0,"signal":null}"#);
    }

    #[test]
    fn test_text_message_tags() {
        let json = serde_json::to_string(&TextMessage::Resize { cols: 120, rows: 40 }).unwrap();
        assert_eq!(json, r#"{"type":"resize","cols":120,"rows":40}"#);

        let json = serde_json::to_string(&TextMessage::Exit {
            exit_code: 1,
            signal: Some(9),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"exit","exitCode":1,"signal":9}"#);
    }

    #[test]
    fn test_terminal_path_is_absolute() {
        assert!(TERMINAL_PATH.starts_with('/'));
    }
}
