// This file is part of gglite, a lightweight IoT edge agent runtime
// Copyright (C) 2023 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::fmt;
use std::io;

/// Failure classes used across the bus and the MQTT dispatcher.
///
/// The numeric codes are part of the wire protocol (they travel in
/// ErrorResponse frames) and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Ok,
    Invalid,
    NoMem,
    NoEntry,
    NoConn,
    Range,
    Unsupported,
    Parse,
    Config,
    Remote,
    Timeout,
    Fatal,
    Failure,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::Ok => 0,
            ErrorKind::Invalid => 1,
            ErrorKind::NoMem => 2,
            ErrorKind::NoEntry => 3,
            ErrorKind::NoConn => 4,
            ErrorKind::Range => 5,
            ErrorKind::Unsupported => 6,
            ErrorKind::Parse => 7,
            ErrorKind::Config => 8,
            ErrorKind::Remote => 9,
            ErrorKind::Timeout => 10,
            ErrorKind::Fatal => 11,
            ErrorKind::Failure => 12,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let kind = match code {
            0 => ErrorKind::Ok,
            1 => ErrorKind::Invalid,
            2 => ErrorKind::NoMem,
            3 => ErrorKind::NoEntry,
            4 => ErrorKind::NoConn,
            5 => ErrorKind::Range,
            6 => ErrorKind::Unsupported,
            7 => ErrorKind::Parse,
            8 => ErrorKind::Config,
            9 => ErrorKind::Remote,
            10 => ErrorKind::Timeout,
            11 => ErrorKind::Fatal,
            12 => ErrorKind::Failure,
            _ => return None,
        };

        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Ok => "ok",
            ErrorKind::Invalid => "invalid argument",
            ErrorKind::NoMem => "out of memory",
            ErrorKind::NoEntry => "no such entry",
            ErrorKind::NoConn => "no connection",
            ErrorKind::Range => "out of range",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Parse => "parse error",
            ErrorKind::Config => "configuration error",
            ErrorKind::Remote => "remote error",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Fatal => "fatal error",
            ErrorKind::Failure => "failure",
        };

        f.write_str(name)
    }
}

/// An error from a bus or dispatcher operation.
///
/// `kind` classifies the local failure. For kind `Remote` the peer's own
/// failure kind is carried in `remote_kind`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {context}")]
pub struct Error {
    kind: ErrorKind,
    context: String,
    remote_kind: Option<ErrorKind>,
}

impl Error {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            remote_kind: None,
        }
    }

    /// An application error reported by the remote side of a call.
    pub fn remote(remote_kind: ErrorKind) -> Self {
        Self {
            kind: ErrorKind::Remote,
            context: format!("peer reported: {}", remote_kind),
            remote_kind: Some(remote_kind),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn remote_kind(&self) -> Option<ErrorKind> {
        self.remote_kind
    }

    /// The remote kind for `Remote` errors, the local kind otherwise.
    ///
    /// Client helpers use this to re-raise a server-side validation error
    /// as if it had happened locally.
    pub fn effective_kind(&self) -> ErrorKind {
        match (self.kind, self.remote_kind) {
            (ErrorKind::Remote, Some(kind)) => kind,
            (kind, _) => kind,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::NoConn,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::InvalidData => ErrorKind::Parse,
            _ => ErrorKind::Failure,
        };

        Error::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorKind;

    #[test]
    fn codes_round_trip() {
        for code in 0..13 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }

        assert_eq!(ErrorKind::from_code(13), None);
    }
}
