// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Loopback wire protocol shared by Backup Database instances.
//!
//! The running instance listens on a fixed loopback port. Duplicate
//! launches connect to it and send one short ASCII command per
//! connection. The protocol is plain text with no framing: a request is
//! the command string, a reply (when there is one) is a prefixed string,
//! and the connection is closed after each exchange.

/// Name of the machine-global launch lock.
///
/// Must stay stable across versions so old and new builds exclude each other.
pub const LOCK_NAME: &str = "BackupDatabase-SingleInstance-{6f1c2a9e-3d47-4b8a-9c15-2e7f0b4d8a63}";

/// Default loopback port of the notification channel.
pub const DEFAULT_PORT: u16 = 45931;

/// Upper bound for a single request or reply, in bytes.
pub const MAX_MESSAGE_LEN: usize = 256;

/// Command asking the running instance to raise its main window.
pub const SHOW_WINDOW: &str = "SHOW_WINDOW";

/// Command asking the running instance which OS user owns it.
pub const GET_USER_INFO: &str = "GET_USER_INFO";

/// Prefix of the reply to [`GET_USER_INFO`].
pub const USER_INFO_PREFIX: &str = "USER_INFO:";

/// A request sent by a duplicate launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Bring the existing main window to the foreground. Fire-and-forget.
    ShowWindow,
    /// Report the OS user owning the running instance.
    GetOwnerUser,
}

impl Request {
    /// Wire form of the request.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Request::ShowWindow => SHOW_WINDOW,
            Request::GetOwnerUser => GET_USER_INFO,
        }
    }

    /// Whether the server answers this request before closing.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::GetOwnerUser)
    }

    /// Classify a received payload by prefix.
    ///
    /// Trailing bytes after a known command are ignored, so a client that
    /// terminates its command with a newline is still understood.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::Empty);
        }
        if payload.starts_with(SHOW_WINDOW.as_bytes()) {
            Ok(Request::ShowWindow)
        } else if payload.starts_with(GET_USER_INFO.as_bytes()) {
            Ok(Request::GetOwnerUser)
        } else {
            Err(ProtocolError::UnknownRequest(printable(payload)))
        }
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// A reply from the running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// No reply bytes (the answer to [`Request::ShowWindow`]).
    Empty,
    /// Username of the OS account owning the running instance.
    OwnerUser(String),
}

impl Response {
    /// Encode for the wire.
    ///
    /// A username too long for [`MAX_MESSAGE_LEN`] is cut at the last
    /// character boundary that fits.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Empty => Vec::new(),
            Response::OwnerUser(name) => {
                let budget = MAX_MESSAGE_LEN - USER_INFO_PREFIX.len();
                let mut end = name.len().min(budget);
                while !name.is_char_boundary(end) {
                    end -= 1;
                }
                let mut out = Vec::with_capacity(USER_INFO_PREFIX.len() + end);
                out.extend_from_slice(USER_INFO_PREFIX.as_bytes());
                out.extend_from_slice(&name.as_bytes()[..end]);
                out
            }
        }
    }

    /// Decode a reply to [`Request::GetOwnerUser`].
    ///
    /// Invalid UTF-8 is replaced rather than rejected; trailing whitespace
    /// and NUL padding are stripped.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Ok(Response::Empty);
        }
        let rest = payload
            .strip_prefix(USER_INFO_PREFIX.as_bytes())
            .ok_or_else(|| ProtocolError::MissingPrefix(printable(payload)))?;
        let name = String::from_utf8_lossy(rest);
        let name = name.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());
        if name.is_empty() {
            return Ok(Response::Empty);
        }
        Ok(Response::OwnerUser(name.to_string()))
    }
}

/// Protocol-level failures. None of these are fatal to either side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Empty payload")]
    Empty,
    #[error("Unknown request: {0:?}")]
    UnknownRequest(String),
    #[error("Reply lacks USER_INFO: prefix: {0:?}")]
    MissingPrefix(String),
}

/// Short, log-safe rendering of an arbitrary payload.
fn printable(payload: &[u8]) -> String {
    let head = &payload[..payload.len().min(32)];
    String::from_utf8_lossy(head).escape_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(Request::parse(b"SHOW_WINDOW"), Ok(Request::ShowWindow));
        assert_eq!(Request::parse(b"GET_USER_INFO"), Ok(Request::GetOwnerUser));
        assert_eq!(Request::parse(b"SHOW_WINDOW\r\n"), Ok(Request::ShowWindow));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(Request::parse(b""), Err(ProtocolError::Empty));
        assert!(matches!(
            Request::parse(b"show_window"),
            Err(ProtocolError::UnknownRequest(_))
        ));
        assert!(matches!(
            Request::parse(&[0xff, 0x00, 0x13]),
            Err(ProtocolError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_only_user_query_expects_reply() {
        assert!(Request::GetOwnerUser.expects_reply());
        assert!(!Request::ShowWindow.expects_reply());
    }

    #[test]
    fn test_owner_reply_wire_form() {
        let bytes = Response::OwnerUser("alice".to_string()).encode();
        assert_eq!(bytes, b"USER_INFO:alice");
        assert_eq!(
            Response::decode(&bytes),
            Ok(Response::OwnerUser("alice".to_string()))
        );
    }

    #[test]
    fn test_decode_strips_padding() {
        assert_eq!(
            Response::decode(b"USER_INFO:bob\r\n\0\0"),
            Ok(Response::OwnerUser("bob".to_string()))
        );
        assert_eq!(Response::decode(b"USER_INFO:"), Ok(Response::Empty));
        assert_eq!(Response::decode(b""), Ok(Response::Empty));
    }

    #[test]
    fn test_decode_rejects_unprefixed_reply() {
        assert!(matches!(
            Response::decode(b"HELLO"),
            Err(ProtocolError::MissingPrefix(_))
        ));
    }

    #[test]
    fn test_long_username_truncated_on_char_boundary() {
        let name = "é".repeat(200);
        let bytes = Response::OwnerUser(name).encode();
        assert!(bytes.len() <= MAX_MESSAGE_LEN);
        // Still valid UTF-8 after the cut.
        assert!(std::str::from_utf8(&bytes).is_ok());
        assert!(bytes.starts_with(USER_INFO_PREFIX.as_bytes()));
    }

    #[test]
    fn test_non_ascii_username() {
        let bytes = Response::OwnerUser("José".to_string()).encode();
        assert_eq!(
            Response::decode(&bytes),
            Ok(Response::OwnerUser("José".to_string()))
        );
    }
}
