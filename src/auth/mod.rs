mod basic;
mod digest;
mod kerberos;
mod ntlm;
pub mod providers;

pub use digest::DigestChallenge;
pub use providers::{
    Credentials, DigestCalculator, DigestInput, KerberosAuthenticator, MessageEncryptor,
    NtlmContext, NtlmProvider,
};

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::client::{Client, Wait};
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    None,
    Basic,
    Digest,
    Ntlm,
    Negotiate,
    Kerberos,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthScheme::None => "None",
            AuthScheme::Basic => "Basic",
            AuthScheme::Digest => "Digest",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Negotiate => "Negotiate",
            AuthScheme::Kerberos => "Kerberos",
        })
    }
}

/// Unanchored scheme-token scan: folded headers can leave a scheme
/// keyword anywhere in the value, so the match only requires word
/// boundaries.
fn has_token(value: &str, token: &str) -> bool {
    let hay = value.to_ascii_lowercase();
    let needle = token.to_ascii_lowercase();
    let bytes = hay.as_bytes();
    let mut start = 0;
    while let Some(pos) = hay[start..].find(&needle) {
        let pos = start + pos;
        let end = pos + needle.len();
        let before_ok = pos == 0 || !bytes[pos - 1].is_ascii_alphanumeric();
        let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if before_ok && after_ok {
            return true;
        }
        start = end;
    }
    false
}

const SCHEME_ORDER: &[(AuthScheme, &str)] = &[
    (AuthScheme::Basic, "Basic"),
    (AuthScheme::Digest, "Digest"),
    (AuthScheme::Ntlm, "NTLM"),
    (AuthScheme::Negotiate, "Negotiate"),
    (AuthScheme::Kerberos, "Kerberos"),
];

/// Every scheme the challenge offers, across all WWW-Authenticate fields.
pub fn offered_schemes(res: &Response) -> Vec<AuthScheme> {
    let mut out = Vec::new();
    for value in res.headers.get_all("WWW-Authenticate") {
        for (scheme, token) in SCHEME_ORDER {
            if has_token(value, token) && !out.contains(scheme) {
                out.push(*scheme);
            }
        }
    }
    out
}

/// First supported scheme in preference order, with `preferred_auth`
/// jumping the queue when the server offers it.
pub fn select_scheme(offered: &[AuthScheme], preferred: Option<&str>) -> AuthScheme {
    if let Some(name) = preferred {
        if let Some(scheme) = offered
            .iter()
            .find(|s| s.to_string().eq_ignore_ascii_case(name))
        {
            return *scheme;
        }
    }
    for (scheme, _) in SCHEME_ORDER {
        if offered.contains(scheme) {
            return *scheme;
        }
    }
    AuthScheme::None
}

/// Pulls the base64 blob out of a `WWW-Authenticate: <keyword> <b64>`
/// field.
pub(crate) fn challenge_token(res: &Response, keyword: &str) -> Option<Vec<u8>> {
    for value in res.headers.get_all("WWW-Authenticate") {
        let value = value.trim();
        let mut fields = value.split_whitespace();
        let Some(scheme) = fields.next() else {
            continue;
        };
        if !scheme.eq_ignore_ascii_case(keyword) {
            continue;
        }
        if let Some(blob) = fields.next() {
            if let Ok(decoded) = BASE64.decode(blob.trim_end_matches(',')) {
                return Some(decoded);
            }
        }
    }
    None
}

impl Client {
    /// The 401 path of `send_recv`: pick a scheme the server offered and
    /// we can drive, then run its legs. Always resolves to a response
    /// (the last valid one) rather than an error; disconnects mid-leg are
    /// swallowed.
    pub(crate) async fn run_auth(
        &mut self,
        first: Response,
        req: &Request,
        wait: Wait,
    ) -> Result<Option<Response>, Error> {
        let Some(spec) = req.spec() else {
            return Ok(Some(first));
        };
        let creds = self.credentials();
        if creds.is_empty() && self.kerberos.is_none() {
            return Ok(Some(first));
        }

        let offered: Vec<AuthScheme> = offered_schemes(&first)
            .into_iter()
            .filter(|scheme| self.can_drive(*scheme))
            .collect();
        let preferred = self.config.get_str("preferred_auth").map(str::to_string);
        let scheme = select_scheme(&offered, preferred.as_deref());
        if scheme != AuthScheme::None {
            tracing::debug!(%scheme, peer = ?self.peerinfo(), "answering 401 challenge");
        }

        let spec = spec.clone();
        let outcome = match scheme {
            AuthScheme::None => return Ok(Some(first)),
            AuthScheme::Basic => basic::run(self, &spec, wait).await?,
            AuthScheme::Digest => digest::run(self, &spec, wait, &first).await?,
            AuthScheme::Ntlm => ntlm::run(self, &spec, wait, "NTLM").await?,
            AuthScheme::Negotiate => ntlm::run(self, &spec, wait, "Negotiate").await?,
            AuthScheme::Kerberos => kerberos::run(self, &spec, wait).await?,
        };
        Ok(outcome.or(Some(first)))
    }

    fn can_drive(&self, scheme: AuthScheme) -> bool {
        match scheme {
            AuthScheme::Basic => !self.credentials().is_empty(),
            AuthScheme::Digest => self.digest.is_some() && !self.credentials().is_empty(),
            AuthScheme::Ntlm | AuthScheme::Negotiate => {
                self.ntlm.is_some() && !self.credentials().is_empty()
            }
            AuthScheme::Kerberos => self.kerberos.is_some(),
            AuthScheme::None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with_challenges(values: &[&str]) -> Response {
        let mut wire = String::from("HTTP/1.1 401 Unauthorized\r\n");
        for value in values {
            wire.push_str(&format!("WWW-Authenticate: {value}\r\n"));
        }
        wire.push_str("Content-Length: 0\r\n\r\n");
        let mut res = Response::new(1024);
        res.parse(wire.as_bytes());
        res
    }

    #[test]
    fn scheme_order_prefers_basic_first() {
        let res = response_with_challenges(&["Negotiate", "Basic realm=\"x\"", "NTLM"]);
        let offered = offered_schemes(&res);
        assert_eq!(
            select_scheme(&offered, None),
            AuthScheme::Basic
        );
    }

    #[test]
    fn preferred_auth_jumps_the_queue() {
        let res = response_with_challenges(&["Basic realm=\"x\"", "NTLM"]);
        let offered = offered_schemes(&res);
        assert_eq!(select_scheme(&offered, Some("NTLM")), AuthScheme::Ntlm);
        // a preference the server did not offer falls back to order
        assert_eq!(select_scheme(&offered, Some("Kerberos")), AuthScheme::Basic);
    }

    #[test]
    fn folded_digest_is_found_when_basic_is_absent() {
        let res = response_with_challenges(&["NTLM , Digest realm=\"r\", nonce=\"n\", qop=\"auth\""]);
        let offered = offered_schemes(&res);
        assert_eq!(offered, vec![AuthScheme::Digest, AuthScheme::Ntlm]);
        assert_eq!(select_scheme(&offered, None), AuthScheme::Digest);
    }

    #[test]
    fn token_scan_requires_word_boundaries() {
        assert!(has_token("NTLM", "ntlm"));
        assert!(has_token("Negotiate, NTLM", "NTLM"));
        assert!(!has_token("XNTLMX", "NTLM"));
        assert!(!has_token("NTLMv2", "NTLM"));
    }

    #[test]
    fn challenge_token_decodes_the_blob() {
        let res = response_with_challenges(&["NTLM dHlwZTI="]);
        assert_eq!(challenge_token(&res, "NTLM").unwrap(), b"type2");
        assert_eq!(challenge_token(&res, "Negotiate"), None);
    }
}
