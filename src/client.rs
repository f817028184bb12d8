use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use crate::auth::providers::{Credentials, DigestCalculator, KerberosAuthenticator, NtlmProvider};
use crate::config::ClientConfig;
use crate::conn::{Connection, PeerInfo};
use crate::error::{is_disconnect, Error};
use crate::observe::Observer;
use crate::request::Request;
use crate::response::{ParseCode, ParseState, Response, ResponseError};
use crate::stream::Target;

/// How long a read may take. `Skip` writes the request and never reads
/// (fire-and-forget); `Forever` blocks until the exchange resolves;
/// `For` is a single envelope over the entire response read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    Skip,
    Forever,
    For(Duration),
}

impl Wait {
    /// Maps the conventional signed-seconds timeout: negative means no
    /// timeout, zero means do not read a response.
    pub fn from_secs(t: i64) -> Wait {
        match t {
            t if t < 0 => Wait::Forever,
            0 => Wait::Skip,
            t => Wait::For(Duration::from_secs(t as u64)),
        }
    }
}

/// What a response read resolved to.
#[derive(Debug)]
pub enum ReadOutcome {
    Complete(Response),
    Partial(Response),
    Closed,
    TimedOut,
}

impl ReadOutcome {
    pub fn into_response(self) -> Option<Response> {
        match self {
            ReadOutcome::Complete(res) | ReadOutcome::Partial(res) => Some(res),
            ReadOutcome::Closed | ReadOutcome::TimedOut => None,
        }
    }
}

const TRICKLE_TIMEOUT: Duration = Duration::from_millis(50);
const TRICKLE_ROUNDS: usize = 1000;
const READ_CHUNK: usize = 16 * 1024;

/// A single-connection HTTP/1.x client. One instance owns at most one
/// socket and one in-flight request; parallelism means more instances.
pub struct Client {
    pub config: ClientConfig,
    target: Target,
    pub(crate) conn: Option<Connection>,
    pipelining: bool,
    observer: Option<Box<dyn Observer>>,
    pub(crate) ntlm: Option<Arc<dyn NtlmProvider>>,
    pub(crate) kerberos: Option<Arc<dyn KerberosAuthenticator>>,
    pub(crate) digest: Option<Arc<dyn DigestCalculator>>,
}

impl Client {
    pub fn new(target: Target) -> Client {
        Client::with_config(target, ClientConfig::default())
    }

    pub fn with_config(target: Target, config: ClientConfig) -> Client {
        Client {
            config,
            target,
            conn: None,
            pipelining: false,
            observer: None,
            ntlm: None,
            kerberos: None,
            digest: None,
        }
    }

    pub fn set_config(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.config.set(name, value)
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn set_observer(&mut self, observer: Box<dyn Observer>) {
        self.observer = Some(observer);
    }

    pub fn set_ntlm_provider(&mut self, provider: Arc<dyn NtlmProvider>) {
        self.ntlm = Some(provider);
    }

    pub fn set_kerberos_authenticator(&mut self, authenticator: Arc<dyn KerberosAuthenticator>) {
        self.kerberos = Some(authenticator);
    }

    pub fn set_digest_calculator(&mut self, calculator: Arc<dyn DigestCalculator>) {
        self.digest = Some(calculator);
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn peerinfo(&self) -> Option<&PeerInfo> {
        self.conn.as_ref().map(|conn| conn.peerinfo())
    }

    pub(crate) fn credentials(&self) -> Credentials {
        Credentials {
            username: self.config.get_str("username").unwrap_or("").to_string(),
            password: self.config.get_str("password").unwrap_or("").to_string(),
            domain: self.config.get_str("domain").unwrap_or("").to_string(),
        }
    }

    /// Tears down the socket and with it any NTLM or Kerberos session.
    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// The dial target with config-level overrides applied.
    fn dial_target(&self) -> Target {
        let mut target = self.target.clone();
        if let Some(sni) = self.config.get_str("ssl_server_name_indication") {
            target.sni = Some(sni.to_string());
        }
        target
    }

    async fn ensure_connected(&mut self) -> Result<bool, Error> {
        if self.conn.is_some() {
            if self.pipelining {
                return Ok(true);
            }
            self.close().await;
        }
        self.conn = Some(Connection::open(&self.dial_target()).await?);
        Ok(false)
    }

    /// Opens a fresh connection and writes the request to it.
    async fn redial_and_send(&mut self, bytes: &Bytes) -> Result<(), Error> {
        self.conn = Some(Connection::open(&self.dial_target()).await?);
        let conn = self.conn.as_mut().expect("just connected");
        conn.stream
            .write_all(bytes)
            .await
            .map_err(|err| Error::Connect(Box::new(err)))?;
        conn.stream
            .flush()
            .await
            .map_err(|err| Error::Connect(Box::new(err)))?;
        Ok(())
    }

    /// Connects or reuses, then writes. A kept-alive connection that
    /// fails the write immediately is assumed stale: redial once and
    /// resend. Returns whether the request went out on a reused
    /// connection, so the read side can apply the same stale policy to
    /// a first read that fails before any bytes arrive.
    pub(crate) async fn write_wire(&mut self, bytes: &Bytes) -> Result<bool, Error> {
        let reused = self.ensure_connected().await?;
        let conn = self.conn.as_mut().expect("just connected");
        match conn.stream.write_all(bytes).await {
            Ok(()) => {}
            Err(err) if reused && is_disconnect(&err) => {
                tracing::debug!("kept-alive connection went stale, redialing");
                self.close().await;
                self.redial_and_send(bytes).await?;
                return Ok(false);
            }
            Err(err) => {
                self.close().await;
                return Err(Error::Connect(Box::new(err)));
            }
        }
        self.conn
            .as_mut()
            .expect("just connected")
            .stream
            .flush()
            .await
            .map_err(|err| Error::Connect(Box::new(err)))?;
        Ok(reused)
    }

    /// The full pipeline: observer, transform hooks, write, read, attach
    /// back-references, and — on a 401 with a usable challenge — the auth
    /// coordinator.
    pub async fn send_recv(
        &mut self,
        req: Request,
        wait: Wait,
        persist: bool,
    ) -> Result<Option<Response>, Error> {
        let mut res = self.send_recv_inner(req.clone(), wait, persist, true).await?;
        if let Some(first) = res.take() {
            if first.code == 401 && first.headers.contains("WWW-Authenticate") {
                res = self.run_auth(first, &req, wait).await?;
            } else {
                res = Some(first);
            }
        }
        self.finish_exchange(persist, res.as_ref()).await;
        Ok(res)
    }

    /// `send_recv` without the 401 delegation; what the auth legs use to
    /// avoid recursing.
    pub async fn send_recv_once(
        &mut self,
        req: Request,
        wait: Wait,
        persist: bool,
    ) -> Result<Option<Response>, Error> {
        let res = self.send_recv_inner(req, wait, persist, true).await?;
        self.finish_exchange(persist, res.as_ref()).await;
        Ok(res)
    }

    /// The end-of-exchange close policy. Mid-exchange (auth legs, the
    /// interim leg of a 100-Continue) the connection is left alone even
    /// for non-persistent calls, so multi-leg handshakes stay on one
    /// socket; a stale non-pipelined connection is replaced at the next
    /// connect.
    async fn finish_exchange(&mut self, persist: bool, res: Option<&Response>) {
        self.pipelining = persist;
        let wants_close = res.map(Response::wants_close).unwrap_or(false);
        if !persist || wants_close {
            self.close().await;
        }
    }

    pub(crate) async fn send_recv_inner(
        &mut self,
        mut req: Request,
        wait: Wait,
        persist: bool,
        apply_hooks: bool,
    ) -> Result<Option<Response>, Error> {
        self.pipelining = persist;
        if let Request::Structured(spec) = &mut req {
            if spec.connection.is_none() {
                spec.connection = Some(if persist { "Keep-Alive" } else { "close" }.to_string());
            }
        }

        if let Some(observer) = self.observer.as_mut() {
            observer.on_request(&req);
        }

        let mut bytes = req.to_bytes(&self.config, &self.target)?;
        let structured = matches!(req, Request::Structured(_));
        if apply_hooks && structured {
            if let Some(conn) = self.conn.as_mut() {
                if let Some(ctx) = conn.session.ntlm.as_mut() {
                    bytes = ctx.transform_request(bytes);
                } else if let Some(enc) = conn.session.krb.as_mut() {
                    bytes = enc.transform_request(bytes);
                }
            }
        }

        let reused = self.write_wire(&bytes).await?;
        if wait == Wait::Skip {
            return Ok(None);
        }
        // captured now: the read may consume the connection
        let peer = self.peerinfo().cloned();

        let method = req.spec().map(|spec| spec.method.clone());
        let outcome = self
            .read_response_inner(wait, method.as_deref(), reused.then_some(&bytes))
            .await;
        let mut res = match outcome.into_response() {
            Some(res) => res,
            None => {
                if let Some(observer) = self.observer.as_mut() {
                    observer.on_response(None);
                }
                return Ok(None);
            }
        };

        if apply_hooks && structured {
            if let Some(conn) = self.conn.as_mut() {
                if let Some(ctx) = conn.session.ntlm.as_mut() {
                    ctx.transform_response(&mut res);
                } else if let Some(enc) = conn.session.krb.as_mut() {
                    enc.transform_response(&mut res);
                }
            }
        }

        res.request = Some(bytes);
        res.peer = peer;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_response(Some(&res));
        }

        if res.wants_close() || res.error != ResponseError::None {
            self.close().await;
        }
        Ok(Some(res))
    }

    /// One auth leg on the pinned connection. Transport failures are
    /// swallowed: the connection is torn down and the leg yields nothing,
    /// leaving the coordinator to fall back to the last valid response.
    pub(crate) async fn auth_leg(
        &mut self,
        req: Request,
        wait: Wait,
        apply_hooks: bool,
    ) -> Option<Response> {
        match self.send_recv_inner(req, wait, true, apply_hooks).await {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!(%err, "auth leg aborted");
                self.close().await;
                None
            }
        }
    }

    /// Reads one logical response: drives the incremental parser, applies
    /// the 100-Continue workaround, tolerates trickling text/html bodies,
    /// and maps disconnects and timeouts onto the truncation policy.
    pub async fn read_response(&mut self, wait: Wait, method: Option<&str>) -> ReadOutcome {
        self.read_response_inner(wait, method, None).await
    }

    /// `resend` carries the request bytes when they went out on a reused
    /// connection: a kept-alive peer may accept the write and only then
    /// reveal it already hung up, so an EOF before the status line gets
    /// one redial-and-resend, mirroring the write path.
    pub(crate) async fn read_response_inner(
        &mut self,
        wait: Wait,
        method: Option<&str>,
        resend: Option<&Bytes>,
    ) -> ReadOutcome {
        let mut resend = resend;
        let max_data = match self.config.get_int("read_max_data") {
            n if n > 0 => n as usize,
            _ => crate::config::DEFAULT_READ_MAX_DATA as usize,
        };
        let deadline = match wait {
            Wait::For(limit) => Some(Instant::now() + limit),
            _ => None,
        };

        let mut skip_100 = false;
        let mut carry: Option<Bytes> = None;
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let mut res = Response::for_method(max_data, method);
            let mut code = ParseCode::NeedMore;
            let mut eof = false;

            if let Some(bytes) = carry.take() {
                code = res.parse(&bytes);
            }

            while code == ParseCode::NeedMore {
                let n = if self.conn.is_none() {
                    0
                } else {
                    match self.read_some(&mut buf, deadline).await {
                        ReadStep::Data(n) => n,
                        ReadStep::Eof => 0,
                        ReadStep::TimedOut => {
                            // a half-read response would desynchronize the
                            // connection; it cannot be kept
                            self.close().await;
                            if self.config.get_bool("partial")
                                && res.state() != ParseState::AwaitingStatus
                            {
                                res.finish();
                                return ReadOutcome::Partial(res);
                            }
                            return ReadOutcome::TimedOut;
                        }
                    }
                };
                if n == 0 {
                    if res.state() == ParseState::AwaitingStatus && resend.is_some() {
                        let bytes = resend.take().expect("checked above");
                        tracing::debug!(
                            "kept-alive connection died before the status line, redialing"
                        );
                        self.close().await;
                        match self.redial_and_send(bytes).await {
                            Ok(()) => {
                                res = Response::for_method(max_data, method);
                                continue;
                            }
                            Err(err) => {
                                tracing::warn!(%err, "resend after stale read failed");
                            }
                        }
                    }
                    eof = true;
                    code = res.finish();
                    break;
                }
                // bytes arrived, so the connection was live; any later
                // disconnect is the peer's answer, not staleness
                resend = None;
                code = res.parse(&buf[..n]);
            }

            if eof {
                self.close().await;
            }

            match code {
                ParseCode::Error => {
                    // covers both malformed framing and a disconnect
                    // before the body; either way the caller gets nothing
                    if res.error == ResponseError::Parse {
                        tracing::warn!(peer = ?self.peerinfo(), "malformed response, discarding");
                    }
                    self.close().await;
                    return ReadOutcome::Closed;
                }
                ParseCode::NeedMore => unreachable!("parser left in NeedMore after read loop"),
                ParseCode::Completed => {
                    if res.error == ResponseError::Truncated {
                        self.close().await;
                        return ReadOutcome::Partial(res);
                    }
                    if res.code == 100 && res.version == "1.1" && !skip_100 {
                        // some servers glue the real response onto the
                        // interim one; others need a second read
                        if res.body.starts_with(b"HTTP/") {
                            carry = Some(res.body.clone().freeze());
                            continue;
                        }
                        if self.conn.is_some() {
                            skip_100 = true;
                            continue;
                        }
                    }
                    if !eof {
                        self.trickle_html(&mut res).await;
                    }
                    return ReadOutcome::Complete(res);
                }
            }
        }
    }

    /// Servers that close early on text/html sometimes still have bytes
    /// in flight; poll briefly for them until the closing tag shows up.
    async fn trickle_html(&mut self, res: &mut Response) {
        if res.content_length().is_some() {
            return;
        }
        let is_html = res
            .headers
            .get("Content-Type")
            .map(|v| v.to_ascii_lowercase().starts_with("text/html"))
            .unwrap_or(false);
        if !is_html || body_has_html_end(&res.body) {
            return;
        }

        let mut buf = vec![0u8; 4096];
        for _ in 0..TRICKLE_ROUNDS {
            let Some(conn) = self.conn.as_mut() else {
                return;
            };
            match tokio::time::timeout(TRICKLE_TIMEOUT, conn.stream.read(&mut buf)).await {
                Ok(Ok(0)) => {
                    self.close().await;
                    return;
                }
                Ok(Ok(n)) => {
                    let room = res.max_data.saturating_sub(res.body.len());
                    res.body.extend_from_slice(&buf[..n.min(room)]);
                    if room <= n || body_has_html_end(&res.body) {
                        return;
                    }
                }
                Ok(Err(_)) | Err(_) => return,
            }
        }
    }

    async fn read_some(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> ReadStep {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return ReadStep::Eof,
        };
        let read = conn.stream.read(buf);
        let result = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    return ReadStep::TimedOut;
                }
                match tokio::time::timeout(deadline - now, read).await {
                    Ok(result) => result,
                    Err(_) => return ReadStep::TimedOut,
                }
            }
            None => read.await,
        };
        match result {
            Ok(0) => ReadStep::Eof,
            Ok(n) => ReadStep::Data(n),
            Err(err) if is_disconnect(&err) => ReadStep::Eof,
            Err(err) => {
                tracing::warn!(%err, "socket read failed");
                ReadStep::Eof
            }
        }
    }
}

enum ReadStep {
    Data(usize),
    Eof,
    TimedOut,
}

fn body_has_html_end(body: &[u8]) -> bool {
    body.windows(7)
        .any(|window| window.eq_ignore_ascii_case(b"</html>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_maps_signed_seconds() {
        assert_eq!(Wait::from_secs(-1), Wait::Forever);
        assert_eq!(Wait::from_secs(0), Wait::Skip);
        assert_eq!(Wait::from_secs(7), Wait::For(Duration::from_secs(7)));
    }

    #[test]
    fn html_end_scan_is_case_insensitive() {
        assert!(body_has_html_end(b"...</HTML>"));
        assert!(body_has_html_end(b"x</html>y"));
        assert!(!body_has_html_end(b"</htm"));
    }

    #[test]
    fn credentials_come_from_config() {
        let mut client = Client::new(Target::with_host("h", 80).build());
        client.set_config("username", "u").unwrap();
        client.set_config("password", "p").unwrap();
        client.set_config("domain", "CORP").unwrap();
        let creds = client.credentials();
        assert_eq!(creds.username, "u");
        assert_eq!(creds.password, "p");
        assert_eq!(creds.domain, "CORP");
        assert!(!creds.is_empty());
        assert!(Client::new(Target::with_host("h", 80).build())
            .credentials()
            .is_empty());
    }
}
