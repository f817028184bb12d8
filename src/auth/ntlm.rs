use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::client::{Client, Wait};
use crate::error::Error;
use crate::evasion;
use crate::request::RequestSpec;
use crate::response::Response;

use super::challenge_token;

/// The NTLM / Negotiate handshake: Type-1 and Type-3 on one persistent
/// connection, with an optional third leg carrying the deferred body.
/// `keyword` is `Negotiate` unless the server (or `preferred_auth`)
/// explicitly selected `NTLM`.
pub(crate) async fn run(
    client: &mut Client,
    spec: &RequestSpec,
    wait: Wait,
    keyword: &str,
) -> Result<Option<Response>, Error> {
    let Some(provider) = client.ntlm.clone() else {
        return Ok(None);
    };
    let creds = client.credentials();
    let workstation = evasion::rand_text_alpha_range(6, 13);
    let type1 = match provider.negotiate(&creds.domain, &workstation) {
        Ok(msg) => msg,
        Err(err) => {
            tracing::warn!(%err, "ntlm negotiate failed");
            return Ok(None);
        }
    };

    let defer = client.config.get_bool("no_body_for_auth");
    let base = if defer { spec.without_body() } else { spec.clone() };

    let mut leg1 = base.clone();
    leg1.add_header(
        "Authorization",
        format!("{keyword} {}", BASE64.encode(&type1)),
    );
    let Some(res1) = client.auth_leg(leg1.into(), wait, false).await else {
        return Ok(None);
    };
    if res1.code != 401 {
        return Ok(Some(res1));
    }
    let Some(type2) = challenge_token(&res1, keyword) else {
        tracing::warn!("server did not return a Type-2 challenge");
        return Ok(Some(res1));
    };

    let binding = client
        .conn
        .as_ref()
        .and_then(|conn| conn.channel_binding())
        .map(<[u8]>::to_vec);
    let (type3, context) = match provider.authenticate(&type2, &creds, binding.as_deref()) {
        Ok(out) => out,
        Err(err) => {
            tracing::warn!(%err, "ntlm authenticate failed");
            return Ok(Some(res1));
        }
    };
    if let Some(conn) = client.conn.as_mut() {
        conn.session.clear();
        conn.session.ntlm = Some(context);
    }

    let mut leg2 = base;
    leg2.add_header(
        "Authorization",
        format!("{keyword} {}", BASE64.encode(&type3)),
    );
    let Some(res2) = client.auth_leg(leg2.into(), wait, false).await else {
        return Ok(Some(res1));
    };

    if defer && res2.code != 401 {
        // the real request, now inside the authenticated session
        let Some(res3) = client.auth_leg(spec.clone().into(), wait, true).await else {
            return Ok(Some(res2));
        };
        return Ok(Some(res3));
    }
    Ok(Some(res2))
}
