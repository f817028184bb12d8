use std::collections::HashMap;

use crate::client::{Client, Wait};
use crate::error::Error;
use crate::request::RequestSpec;
use crate::response::Response;

use super::providers::DigestInput;

/// Parameters parsed out of a `Digest` challenge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DigestChallenge {
    params: HashMap<String, String>,
}

impl DigestChallenge {
    /// Parses the parameter list that follows the `Digest` keyword. The
    /// match is deliberately unanchored: folded headers can leave the
    /// keyword mid-value (`NTLM , Digest realm="r", ...`).
    pub fn from_header(value: &str) -> Option<DigestChallenge> {
        let lower = value.to_ascii_lowercase();
        let at = lower.find("digest ")?;
        let rest = &value[at + "digest ".len()..];

        let mut params = HashMap::new();
        for field in rest.split(", ") {
            let Some((name, value)) = field.split_once('=') else {
                continue;
            };
            params.insert(
                name.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            );
        }
        if params.is_empty() {
            return None;
        }
        Some(DigestChallenge { params })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn realm(&self) -> Option<&str> {
        self.get("realm")
    }

    pub fn nonce(&self) -> Option<&str> {
        self.get("nonce")
    }

    pub fn qop(&self) -> Option<&str> {
        self.get("qop")
    }

    pub fn opaque(&self) -> Option<&str> {
        self.get("opaque")
    }

    pub fn algorithm(&self) -> Option<&str> {
        self.get("algorithm")
    }
}

/// One authenticated request computed by the external digest primitive.
pub(crate) async fn run(
    client: &mut Client,
    spec: &RequestSpec,
    wait: Wait,
    first: &Response,
) -> Result<Option<Response>, Error> {
    let Some(calculator) = client.digest.clone() else {
        return Ok(None);
    };
    let Some(challenge) = first
        .headers
        .get_all("WWW-Authenticate")
        .filter_map(DigestChallenge::from_header)
        .next()
    else {
        tracing::warn!("401 offered Digest but the challenge did not parse");
        return Ok(None);
    };

    let creds = client.credentials();
    let input = DigestInput {
        method: &spec.method,
        uri: &spec.uri,
        creds: &creds,
        challenge: &challenge,
        iis: client.config.get_bool("digest_auth_iis"),
    };
    let params = match calculator.respond(&input) {
        Ok(params) => params,
        Err(err) => {
            tracing::warn!(%err, "digest computation failed");
            return Ok(None);
        }
    };

    let mut authed = spec.clone();
    authed.add_header("Authorization", format!("Digest {params}"));
    Ok(client.auth_leg(authed.into(), wait, false).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_challenge_parses() {
        let ch = DigestChallenge::from_header(
            "Digest realm=\"test\", nonce=\"abc123\", qop=\"auth\", opaque=\"xyz\"",
        )
        .unwrap();
        assert_eq!(ch.realm(), Some("test"));
        assert_eq!(ch.nonce(), Some("abc123"));
        assert_eq!(ch.qop(), Some("auth"));
        assert_eq!(ch.opaque(), Some("xyz"));
        assert_eq!(ch.algorithm(), None);
    }

    #[test]
    fn folded_challenge_matches_mid_value() {
        // a folded continuation leaves the Digest keyword inside the value
        let ch = DigestChallenge::from_header(
            "NTLM , Digest realm=\"r\", nonce=\"n\", qop=\"auth\"",
        )
        .unwrap();
        assert_eq!(ch.realm(), Some("r"));
        assert_eq!(ch.nonce(), Some("n"));
        assert_eq!(ch.qop(), Some("auth"));
    }

    #[test]
    fn missing_digest_keyword_is_none() {
        assert_eq!(DigestChallenge::from_header("Basic realm=\"x\""), None);
        assert_eq!(DigestChallenge::from_header("NTLM"), None);
    }
}
