use std::fmt;
use std::io;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised synchronously by the client. Wire-level conditions that a
/// caller is expected to handle as data (truncation, timeouts, parse
/// failures) are reported through `ReadOutcome` and `Response::error`
/// instead of this type.
#[derive(Debug)]
pub enum Error {
    /// A config write was rejected by the schema.
    InvalidOption {
        name: String,
        value: String,
        allowed: &'static [&'static str],
    },
    /// The socket factory could not produce a connection.
    Connect(BoxError),
    /// A field that must be ASCII-clean contained bytes that cannot go on
    /// the wire.
    Encode(String),
    /// The request options contradict each other.
    InconsistentRequest(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidOption {
                name,
                value,
                allowed,
            } => {
                write!(
                    f,
                    "invalid value {:?} for option {:?} (allowed: {})",
                    value,
                    name,
                    allowed.join(", ")
                )
            }
            Error::Connect(err) => write!(f, "connect failed: {}", err),
            Error::Encode(msg) => write!(f, "encode error: {}", msg),
            Error::InconsistentRequest(msg) => write!(f, "inconsistent request: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// True for the io error kinds that mean the peer went away mid-exchange.
/// Auth legs swallow these; plain reads map them onto the truncation
/// policy.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_option_names_the_choices() {
        let err = Error::InvalidOption {
            name: "uri_encode_mode".into(),
            value: "bogus".into(),
            allowed: &["hex-normal", "hex-all"],
        };
        let text = err.to_string();
        assert!(text.contains("uri_encode_mode"));
        assert!(text.contains("hex-normal"));
    }

    #[test]
    fn disconnect_classification() {
        assert!(is_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_disconnect(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
