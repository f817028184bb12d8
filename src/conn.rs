use std::fmt;
use std::net::IpAddr;

use tokio::io::AsyncWriteExt;

use crate::auth::providers::{MessageEncryptor, NtlmContext};
use crate::error::Error;
use crate::stream::{dial, AsyncReadWriteBox, Target};

/// The resolved peer of a live connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: IpAddr,
    pub port: u16,
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// Authentication state pinned to one connection. At most one of the two
/// contexts is active at a time; both die with the connection.
#[derive(Default)]
pub struct Session {
    pub ntlm: Option<Box<dyn NtlmContext>>,
    pub krb: Option<Box<dyn MessageEncryptor>>,
}

impl Session {
    pub fn clear(&mut self) {
        self.ntlm = None;
        self.krb = None;
    }

    pub fn is_empty(&self) -> bool {
        self.ntlm.is_none() && self.krb.is_none()
    }
}

/// One open socket plus everything scoped to its lifetime.
pub struct Connection {
    pub stream: AsyncReadWriteBox,
    peer: PeerInfo,
    peer_cert: Option<Vec<u8>>,
    pub session: Session,
}

impl Connection {
    pub async fn open(target: &Target) -> Result<Connection, Error> {
        let dialed = dial(target).await.map_err(Error::Connect)?;
        tracing::debug!(peer = %dialed.peer, ssl = target.ssl, "connected");
        Ok(Connection {
            stream: dialed.stream,
            peer: dialed.peer,
            peer_cert: dialed.peer_cert,
            session: Session::default(),
        })
    }

    pub fn peerinfo(&self) -> &PeerInfo {
        &self.peer
    }

    /// The TLS leaf certificate in DER form, for the NTLM provider to
    /// derive its channel-binding token from. None on plaintext
    /// connections.
    pub fn channel_binding(&self) -> Option<&[u8]> {
        self.peer_cert.as_deref()
    }

    /// Orderly shutdown. The session (and with it any NTLM or Kerberos
    /// context) is dropped with the connection.
    pub async fn close(mut self) {
        self.session.clear();
        if let Err(err) = self.stream.shutdown().await {
            tracing::debug!(%err, "shutdown on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;

    use crate::response::Response;

    struct CountingContext(usize);

    impl NtlmContext for CountingContext {
        fn transform_request(&mut self, req: Bytes) -> Bytes {
            self.0 += 1;
            req
        }

        fn transform_response(&mut self, _res: &mut Response) {}
    }

    #[test]
    fn session_clears_both_contexts() {
        let mut session = Session {
            ntlm: Some(Box::new(CountingContext(0))),
            krb: None,
        };
        assert!(!session.is_empty());
        session.clear();
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn open_and_close_against_a_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let target = Target::with_host("127.0.0.1", port).build();
        let conn = Connection::open(&target).await.unwrap();
        assert_eq!(conn.peerinfo().port, port);
        assert_eq!(conn.peerinfo().to_string(), format!("127.0.0.1:{port}"));
        assert!(conn.channel_binding().is_none());
        conn.close().await;
        accept.await.unwrap();
    }
}
