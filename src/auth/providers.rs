use bytes::Bytes;

use crate::error::BoxError;
use crate::response::Response;

use super::digest::DigestChallenge;

/// Credentials pulled from config for the auth coordinator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// NTLM domain; also reused as the workstation domain in Type-1.
    pub domain: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty()
    }
}

/// The external NTLMSSP implementation. The coordinator only moves its
/// opaque messages across the wire.
pub trait NtlmProvider: Send + Sync {
    /// Builds the Type-1 negotiate message.
    fn negotiate(&self, domain: &str, workstation: &str) -> Result<Vec<u8>, BoxError>;

    /// Builds the Type-3 authenticate message for the server's Type-2
    /// challenge. When the transport is TLS, `channel_binding` carries the
    /// peer certificate DER for the provider to bind against. Returns the
    /// message plus the established context for later signing/sealing.
    fn authenticate(
        &self,
        challenge: &[u8],
        creds: &Credentials,
        channel_binding: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Box<dyn NtlmContext>), BoxError>;
}

/// Per-request NTLM transform hooks, active once a Type-3 exchange has
/// completed on the connection.
pub trait NtlmContext: Send {
    fn transform_request(&mut self, req: Bytes) -> Bytes;
    fn transform_response(&mut self, res: &mut Response);
}

/// The external Kerberos GSS implementation.
pub trait KerberosAuthenticator: Send + Sync {
    /// The initial GSS token for the Authorization header.
    fn initial_token(&self) -> Result<Vec<u8>, BoxError>;

    /// Consumes the server's mutual-auth blob, deriving the session
    /// subkey and sequence numbers, and returns the message encryptor
    /// retained on the connection.
    fn complete(&self, mutual_token: &[u8]) -> Result<Box<dyn MessageEncryptor>, BoxError>;
}

/// Kerberos per-request wrap/unwrap hooks.
pub trait MessageEncryptor: Send {
    fn transform_request(&mut self, req: Bytes) -> Bytes;
    fn transform_response(&mut self, res: &mut Response);
}

/// Input for the external digest primitive.
pub struct DigestInput<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub creds: &'a Credentials,
    pub challenge: &'a DigestChallenge,
    /// Quote the URI the way IIS expects.
    pub iis: bool,
}

/// The external nonce/cnonce/qop hashing primitive. Returns the parameter
/// list that follows `Digest ` in the Authorization header.
pub trait DigestCalculator: Send + Sync {
    fn respond(&self, input: &DigestInput<'_>) -> Result<String, BoxError>;
}
