use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::client::{Client, Wait};
use crate::error::Error;
use crate::request::RequestSpec;
use crate::response::Response;

/// One additional request carrying the base64 credential pair.
pub(crate) async fn run(
    client: &mut Client,
    spec: &RequestSpec,
    wait: Wait,
) -> Result<Option<Response>, Error> {
    let creds = client.credentials();
    let token = BASE64.encode(format!("{}:{}", creds.username, creds.password));

    let mut authed = spec.clone();
    authed.add_header("Authorization", format!("Basic {token}"));
    Ok(client.auth_leg(authed.into(), wait, false).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_pair_round_trips() {
        // the header token must decode back to user:pass
        let token = BASE64.encode("u:p");
        assert_eq!(token, "dTpw");
        assert_eq!(BASE64.decode(token).unwrap(), b"u:p");
    }
}
