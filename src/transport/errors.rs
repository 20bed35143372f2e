use std::fmt;

/// Failures on the Mumble-facing side of a session, grouped by how the
/// gateway reacts to them: a closed control link and configuration problems
/// end the connect attempt, socket trouble tears the session down, and
/// protocol violations are logged with enough context to diagnose the peer.
#[derive(Debug)]
pub enum TransportError {
    /// The TLS control link to the Mumble server ended, cleanly or not.
    ConnectionClosed,
    /// Socket or TLS plumbing failed underneath the protocol.
    Io(String),
    /// The bytes on the wire were not valid Mumble traffic.
    Protocol(String),
    /// The endpoint or credentials were unusable before any I/O started.
    InvalidConfig(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionClosed => write!(f, "mumble control connection closed"),
            TransportError::Io(detail) => write!(f, "transport failure: {detail}"),
            TransportError::Protocol(detail) => write!(f, "mumble protocol violation: {detail}"),
            TransportError::InvalidConfig(detail) => write!(f, "unusable configuration: {detail}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

impl From<CodecError> for TransportError {
    fn from(error: CodecError) -> Self {
        TransportError::Protocol(error.to_string())
    }
}

/// Failures decoding a single wire artifact (varint, voice packet, protobuf
/// field, peer voice envelope). These are recovered in place: the offending
/// packet is dropped and the session continues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    Malformed(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "truncated input"),
            CodecError::Malformed(what) => write!(f, "malformed {what}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Outcome of a connect attempt that never reached `ServerSync`.
#[derive(Debug)]
pub enum ConnectError {
    Timeout,
    Rejected { reason: String },
    Transport(TransportError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Timeout => write!(f, "handshake timed out"),
            ConnectError::Rejected { reason } => write!(f, "server rejected session: {reason}"),
            ConnectError::Transport(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<TransportError> for ConnectError {
    fn from(error: TransportError) -> Self {
        ConnectError::Transport(error)
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecError, ConnectError, TransportError};
    use std::io;

    /// Every transport failure renders enough context to be logged on its
    /// own, without the surrounding call site.
    #[test]
    fn transport_errors_name_their_failure() {
        // Arrange
        let cases = [
            (
                TransportError::ConnectionClosed,
                "mumble control connection closed",
            ),
            (
                TransportError::Io("reset by peer".to_string()),
                "transport failure: reset by peer",
            ),
            (
                TransportError::Protocol("frame overruns buffer".to_string()),
                "mumble protocol violation: frame overruns buffer",
            ),
            (
                TransportError::InvalidConfig("username is required".to_string()),
                "unusable configuration: username is required",
            ),
        ];
        for (error, expected) in cases {
            // Act / Assert
            assert_eq!(error.to_string(), expected);
        }
    }

    /// Socket errors convert into the transport taxonomy so `?` works at
    /// every I/O call site.
    #[test]
    fn socket_errors_become_io_failures() {
        // Arrange
        let error = io::Error::new(io::ErrorKind::ConnectionReset, "peer went away");
        // Act
        let mapped = TransportError::from(error);
        // Assert
        assert!(matches!(mapped, TransportError::Io(_)));
        assert!(mapped.to_string().contains("peer went away"));
    }

    /// Undecodable packets surface as protocol violations when they cross
    /// the transport boundary.
    #[test]
    fn codec_errors_become_protocol_violations() {
        // Arrange
        let error = CodecError::Malformed("voice packet type");
        // Act
        let mapped = TransportError::from(error);
        // Assert
        assert!(matches!(mapped, TransportError::Protocol(_)));
        assert!(mapped.to_string().contains("voice packet type"));
    }

    /// Codec failures distinguish short input from structurally bad input.
    #[test]
    fn codec_errors_describe_the_defect() {
        // Arrange
        // Act / Assert
        assert_eq!(CodecError::Truncated.to_string(), "truncated input");
        assert_eq!(
            CodecError::Malformed("varint").to_string(),
            "malformed varint"
        );
    }

    /// A failed connect keeps whatever the server said about why, and the
    /// timeout case stands on its own.
    #[test]
    fn connect_errors_keep_the_reject_reason() {
        // Arrange
        let rejected = ConnectError::Rejected {
            reason: "server is full".to_string(),
        };
        let lost: ConnectError = TransportError::ConnectionClosed.into();
        // Act / Assert
        assert_eq!(
            rejected.to_string(),
            "server rejected session: server is full"
        );
        assert_eq!(ConnectError::Timeout.to_string(), "handshake timed out");
        assert_eq!(lost.to_string(), "mumble control connection closed");
    }
}
