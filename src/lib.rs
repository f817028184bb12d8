//! A wire-level HTTP/1.x client for protocol testing. It speaks RFC 2616
//! by default and deviates deliberately on demand — encoding tricks,
//! request-line padding, header folding, fake parameters — for
//! fingerprinting servers and exercising inspection layers. A pluggable
//! auth coordinator drives Basic, Digest, NTLM, Negotiate, and Kerberos
//! challenge-response exchanges across multiple legs on one connection,
//! deferring the request body until the handshake completes when asked.

pub mod auth;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod evasion;
pub mod headers;
pub mod observe;
pub mod request;
pub mod response;
pub mod stream;

pub use auth::{AuthScheme, Credentials, DigestChallenge};
pub use client::{Client, ReadOutcome, Wait};
pub use config::ClientConfig;
pub use conn::PeerInfo;
pub use error::{BoxError, Error};
pub use headers::HeaderMap;
pub use observe::Observer;
pub use request::{FormPart, ParamValue, Request, RequestSpec};
pub use response::{ParseCode, ParseState, Response, ResponseError};
pub use stream::Target;
