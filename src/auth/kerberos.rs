use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::client::{Client, Wait};
use crate::error::Error;
use crate::request::RequestSpec;
use crate::response::Response;

use super::challenge_token;

/// One request carrying the initial GSS token; the server's mutual-auth
/// blob seeds the message encryptor retained on the connection.
pub(crate) async fn run(
    client: &mut Client,
    spec: &RequestSpec,
    wait: Wait,
) -> Result<Option<Response>, Error> {
    let Some(authenticator) = client.kerberos.clone() else {
        return Ok(None);
    };
    let token = match authenticator.initial_token() {
        Ok(token) => token,
        Err(err) => {
            tracing::warn!(%err, "kerberos token generation failed");
            return Ok(None);
        }
    };

    let defer = client.config.get_bool("no_body_for_auth");
    let base = if defer { spec.without_body() } else { spec.clone() };

    let mut leg1 = base;
    leg1.add_header(
        "Authorization",
        format!("Kerberos {}", BASE64.encode(&token)),
    );
    let Some(res1) = client.auth_leg(leg1.into(), wait, false).await else {
        return Ok(None);
    };

    if let Some(mutual) = challenge_token(&res1, "Kerberos") {
        match authenticator.complete(&mutual) {
            Ok(encryptor) => {
                if let Some(conn) = client.conn.as_mut() {
                    conn.session.clear();
                    conn.session.krb = Some(encryptor);
                }
            }
            Err(err) => {
                tracing::warn!(%err, "kerberos mutual auth failed");
                return Ok(Some(res1));
            }
        }
    }

    if defer && res1.code != 401 {
        let Some(res2) = client.auth_leg(spec.clone().into(), wait, true).await else {
            return Ok(Some(res1));
        };
        return Ok(Some(res2));
    }
    Ok(Some(res1))
}
