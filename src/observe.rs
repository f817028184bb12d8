use crate::request::Request;
use crate::response::Response;

/// Sees every outbound request and inbound response, including auth legs.
/// `on_request` strictly precedes the matching `on_response`; the
/// response is `None` when the read produced nothing (disconnect, parse
/// failure, timeout without `partial`). A serialized form of the request
/// is available via `to_string` (the canonical rendering, without
/// evasion transforms). Observers must not assume they can mutate either
/// message.
pub trait Observer: Send {
    fn on_request(&mut self, req: &Request);
    fn on_response(&mut self, res: Option<&Response>);
}
