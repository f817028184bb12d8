use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::evasion::{self, PadType, UriEncodeMode};
use crate::stream::Target;

/// A request parameter value. Repeated parameters serialize as repeated
/// `name=value` pairs in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::One(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::One(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::Many(v)
    }
}

/// One part of a multipart/form-data body.
#[derive(Clone, Debug, PartialEq)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Everything the serializer needs to produce one request. Retained after
/// the build so the auth coordinator can replay the request on later legs.
#[derive(Clone, Debug, bon::Builder)]
#[builder(start_fn = with_method)]
pub struct RequestSpec {
    #[builder(start_fn, into)]
    pub method: String,
    #[builder(into, default = String::from("/"))]
    pub uri: String,
    /// Raw query string for non-CGI requests. Mutually exclusive with
    /// `cgi`; CGI requests assemble their query from `vars_get`.
    #[builder(into)]
    pub query: Option<String>,
    #[builder(into, default = String::from("1.1"))]
    pub version: String,
    #[builder(into, default = String::from("HTTP"))]
    pub proto: String,
    #[builder(into)]
    pub vhost: Option<String>,
    #[builder(into)]
    pub agent: Option<String>,
    #[builder(into)]
    pub connection: Option<String>,
    #[builder(into)]
    pub cookie: Option<String>,
    #[builder(default)]
    pub headers: Vec<(String, String)>,
    /// Appended verbatim after the normal header block, before the blank
    /// line. The caller supplies its own CRLFs.
    #[builder(into)]
    pub raw_headers: Option<String>,
    pub data: Option<Bytes>,
    #[builder(default)]
    pub cgi: bool,
    #[builder(default)]
    pub vars_get: Vec<(String, ParamValue)>,
    #[builder(default)]
    pub vars_post: Vec<(String, ParamValue)>,
    #[builder(default)]
    pub vars_form_data: Vec<FormPart>,
    #[builder(into, default = String::from("application/x-www-form-urlencoded"))]
    pub ctype: String,
    #[builder(default = true)]
    pub encode_params: bool,
}

impl RequestSpec {
    /// A plain request with raw-style defaults: GET, `/`, HTTP/1.1.
    pub fn raw(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::with_method(method).uri(uri).build()
    }

    /// A CGI request: the query and body are assembled from the `vars_*`
    /// collections at serialization time.
    pub fn cgi(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self::with_method(method).uri(uri).cgi(true).build()
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Parses `a=1&b=2&a=3` into an ordered parameter list, merging
    /// repeats into `Many`.
    pub fn vars_from_query(query: &str) -> Vec<(String, ParamValue)> {
        let pairs: Vec<(String, String)> =
            serde_urlencoded::from_str(query).unwrap_or_default();
        let mut vars: Vec<(String, ParamValue)> = Vec::new();
        for (name, value) in pairs {
            if let Some((_, existing)) = vars.iter_mut().find(|(n, _)| *n == name) {
                match existing {
                    ParamValue::One(first) => {
                        *existing = ParamValue::Many(vec![std::mem::take(first), value]);
                    }
                    ParamValue::Many(list) => list.push(value),
                }
            } else {
                vars.push((name, ParamValue::One(value)));
            }
        }
        vars
    }

    /// The same request with its payload stripped, for auth legs that
    /// defer the body until the handshake completes.
    pub fn without_body(&self) -> RequestSpec {
        let mut spec = self.clone();
        spec.data = None;
        spec.vars_post.clear();
        spec.vars_form_data.clear();
        spec
    }
}

/// A canonical, evasion-free rendering for observers and logs. No merged
/// config or target is involved: `Host`/`User-Agent` appear only when the
/// spec itself carries them, CGI queries and form bodies are assembled in
/// declaration order, and multipart bodies are omitted (their boundary is
/// chosen at serialization time).
impl fmt::Display for RequestSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut uri = self.uri.clone();
        if self.cgi {
            let pairs = expand_params(&self.vars_get);
            if !pairs.is_empty() {
                uri.push('?');
                uri.push_str(&encode_pairs(&pairs, self.encode_params));
            }
        } else if let Some(query) = &self.query {
            uri.push('?');
            uri.push_str(query);
        }
        write!(f, "{} {} {}/{}\r\n", self.method, uri, self.proto, self.version)?;
        if let Some(vhost) = &self.vhost {
            write!(f, "Host: {vhost}\r\n")?;
        }
        if let Some(agent) = &self.agent {
            write!(f, "User-Agent: {agent}\r\n")?;
        }
        if let Some(connection) = &self.connection {
            write!(f, "Connection: {connection}\r\n")?;
        }
        if let Some(cookie) = &self.cookie {
            write!(f, "Cookie: {cookie}\r\n")?;
        }
        for (name, value) in &self.headers {
            write!(f, "{name}: {value}\r\n")?;
        }
        if let Some(raw) = &self.raw_headers {
            f.write_str(raw)?;
        }
        f.write_str("\r\n")?;
        if let Some(data) = &self.data {
            f.write_str(&String::from_utf8_lossy(data))?;
        } else if self.cgi && !self.vars_post.is_empty() {
            f.write_str(&encode_pairs(
                &expand_params(&self.vars_post),
                self.encode_params,
            ))?;
        }
        Ok(())
    }
}

/// A request is either opaque bytes the caller assembled themselves, or a
/// structured spec the builder serializes. Transform hooks and auth replay
/// only apply to `Structured`.
#[derive(Clone, Debug)]
pub enum Request {
    Raw(Bytes),
    Structured(Box<RequestSpec>),
}

impl Request {
    pub fn spec(&self) -> Option<&RequestSpec> {
        match self {
            Request::Structured(spec) => Some(spec),
            Request::Raw(_) => None,
        }
    }

    pub fn to_bytes(&self, config: &ClientConfig, target: &Target) -> Result<Bytes, Error> {
        match self {
            Request::Raw(bytes) => Ok(bytes.clone()),
            Request::Structured(spec) => build(config, spec, target),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Raw(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            Request::Structured(spec) => spec.fmt(f),
        }
    }
}

impl From<RequestSpec> for Request {
    fn from(spec: RequestSpec) -> Self {
        Request::Structured(Box::new(spec))
    }
}

fn ensure_wire_clean(what: &str, value: &str) -> Result<(), Error> {
    if !value.is_ascii() || value.contains('\r') || value.contains('\n') {
        return Err(Error::Encode(format!("{what} must be ASCII without CR/LF")));
    }
    Ok(())
}

fn expand_params(vars: &[(String, ParamValue)]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (name, value) in vars {
        match value {
            ParamValue::One(v) => pairs.push((name.clone(), v.clone())),
            ParamValue::Many(vs) => {
                for v in vs {
                    pairs.push((name.clone(), v.clone()));
                }
            }
        }
    }
    pairs
}

fn pct(input: &str) -> String {
    url::form_urlencoded::byte_serialize(input.as_bytes()).collect()
}

fn encode_pairs(pairs: &[(String, String)], encode: bool) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            if encode {
                format!("{}={}", pct(k), pct(v))
            } else {
                format!("{k}={v}")
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn junk_pairs(count: i64) -> Vec<(String, String)> {
    let mut rng = rand::thread_rng();
    (0..count.max(0))
        .map(|_| {
            (
                evasion::rand_text_alphanumeric(rng.gen_range(2..=12)),
                evasion::rand_text_alphanumeric(rng.gen_range(2..=12)),
            )
        })
        .collect()
}

fn fake_relative(uri: &str) -> String {
    let mut out = String::new();
    for c in uri.chars() {
        if c == '/' {
            out.push('/');
            out.push_str(&evasion::rand_text_alpha_range(2, 8));
            out.push_str("/../");
        } else {
            out.push(c);
        }
    }
    out
}

fn pad_from(config: &ClientConfig, type_opt: &str, count_opt: &str) -> String {
    let kind: PadType = config
        .get_str(type_opt)
        .unwrap_or("space")
        .parse()
        .unwrap_or(PadType::Space);
    evasion::pad(kind, config.get_int(count_opt).max(0) as usize)
}

fn multipart_body(parts: &[FormPart], boundary: &str) -> BytesMut {
    let mut body = BytesMut::new();
    for part in parts {
        body.put_slice(format!("--{boundary}\r\n").as_bytes());
        let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", part.name);
        if let Some(filename) = &part.filename {
            disposition.push_str(&format!("; filename=\"{filename}\""));
        }
        body.put_slice(disposition.as_bytes());
        body.put_slice(b"\r\n");
        if let Some(ctype) = &part.content_type {
            body.put_slice(format!("Content-Type: {ctype}\r\n").as_bytes());
        }
        body.put_slice(b"\r\n");
        body.put_slice(&part.data);
        body.put_slice(b"\r\n");
    }
    body.put_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}

fn host_value(spec: &RequestSpec, config: &ClientConfig, target: &Target) -> String {
    let host = spec
        .vhost
        .as_deref()
        .or_else(|| config.get_str("vhost"))
        .unwrap_or(&target.host);
    if target.is_default_port() {
        host.to_string()
    } else {
        format!("{}:{}", host, target.port)
    }
}

/// Serializes a request per the merged config, applying every enabled
/// evasion transform. The output is ready for a socket write.
pub fn build(config: &ClientConfig, spec: &RequestSpec, target: &Target) -> Result<Bytes, Error> {
    if spec.cgi && spec.query.is_some() {
        return Err(Error::InconsistentRequest(
            "cgi requests assemble their query from vars_get; raw query must be empty".into(),
        ));
    }
    ensure_wire_clean("method", &spec.method)?;
    ensure_wire_clean("uri", &spec.uri)?;

    let mut method = spec.method.clone();
    if config.get_bool("method_random_valid") {
        method = evasion::rand_valid_method();
    } else if config.get_bool("method_random_invalid") {
        method = evasion::rand_invalid_method();
    }
    if config.get_bool("method_random_case") {
        method = evasion::rand_case(&method);
    }

    let mut uri = spec.uri.clone();
    if config.get_bool("uri_dir_self_reference") {
        uri = uri.replace('/', "/./");
    }
    if config.get_bool("uri_dir_fake_relative") {
        uri = fake_relative(&uri);
    }
    if config.get_bool("uri_use_backslashes") {
        uri = uri.replace('/', "\\");
    }
    if config.get_bool("uri_fake_end") {
        uri.push_str("%00");
    }

    let mode: UriEncodeMode = config
        .get_str("uri_encode_mode")
        .unwrap_or("hex-normal")
        .parse()
        .map_err(Error::Encode)?;
    let encode_count = config.get_int("uri_encode_count").max(0) as usize;
    if encode_count > 0 {
        uri = evasion::encode_uri(&uri, mode, encode_count);
    }

    let mut query = String::new();
    if spec.cgi {
        let mut pairs = expand_params(&spec.vars_get);
        if config.get_bool("pad_get_params") {
            pairs.extend(junk_pairs(config.get_int("pad_get_params_count")));
        }
        if config.get_bool("shuffle_get_params") {
            pairs.shuffle(&mut rand::thread_rng());
        }
        query = encode_pairs(&pairs, spec.encode_params);
    } else if let Some(q) = &spec.query {
        query = q.clone();
    }
    if config.get_bool("uri_fake_params_start") {
        query = if query.is_empty() {
            "foo=bar".to_string()
        } else {
            format!("foo=bar&{query}")
        };
    }
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }

    if config.get_bool("uri_full_url") {
        let prefix = format!("{}://{}", target.scheme(), host_value(spec, config, target));
        uri.insert_str(0, &prefix);
    }

    let mut ctype_header: Option<String> = None;
    let mut body = BytesMut::new();
    if spec.cgi && !spec.vars_form_data.is_empty() {
        let boundary = format!(
            "---------------------------{}",
            evasion::rand_text_alphanumeric(24)
        );
        body = multipart_body(&spec.vars_form_data, &boundary);
        ctype_header = Some(format!("multipart/form-data; boundary={boundary}"));
    } else if spec.cgi && !spec.vars_post.is_empty() {
        let mut pairs = expand_params(&spec.vars_post);
        if config.get_bool("pad_post_params") {
            pairs.extend(junk_pairs(config.get_int("pad_post_params_count")));
        }
        if config.get_bool("shuffle_post_params") {
            pairs.shuffle(&mut rand::thread_rng());
        }
        body.put_slice(encode_pairs(&pairs, spec.encode_params).as_bytes());
        ctype_header = Some(spec.ctype.clone());
    } else if let Some(data) = &spec.data {
        body.put_slice(data);
    }

    let mut version = spec.version.clone();
    if config.get_bool("version_random_valid") {
        version = evasion::rand_valid_version();
    } else if config.get_bool("version_random_invalid") {
        version = evasion::rand_invalid_version();
    }

    let mut out = BytesMut::with_capacity(256 + body.len());
    out.put_slice(method.as_bytes());
    out.put_slice(pad_from(config, "pad_method_uri_type", "pad_method_uri_count").as_bytes());
    out.put_slice(uri.as_bytes());
    out.put_slice(pad_from(config, "pad_uri_version_type", "pad_uri_version_count").as_bytes());
    out.put_slice(format!("{}/{}", spec.proto, version).as_bytes());
    out.put_slice(b"\r\n");

    let chunked = config.get_int("chunked_size") > 0 && !body.is_empty();
    let wants_length = !body.is_empty()
        || spec.data.is_some()
        || matches!(spec.method.to_ascii_uppercase().as_str(), "POST" | "PUT");

    let mut headers: Vec<(String, String)> = Vec::new();
    headers.push(("Host".into(), host_value(spec, config, target)));
    if let Some(agent) = spec.agent.as_deref().or_else(|| config.get_str("agent")) {
        headers.push(("User-Agent".into(), agent.to_string()));
    }
    if let Some(connection) = &spec.connection {
        headers.push(("Connection".into(), connection.clone()));
    }
    if let Some(cookie) = &spec.cookie {
        headers.push(("Cookie".into(), cookie.clone()));
    }
    if let Some(ctype) = ctype_header {
        headers.push(("Content-Type".into(), ctype));
    }
    if chunked {
        headers.push(("Transfer-Encoding".into(), "chunked".into()));
    } else if wants_length {
        headers.push(("Content-Length".into(), body.len().to_string()));
    }
    headers.extend(spec.headers.iter().cloned());
    if config.get_bool("pad_fake_headers") {
        let mut rng = rand::thread_rng();
        for _ in 0..config.get_int("pad_fake_headers_count").max(0) {
            headers.push((
                format!("X-{}", evasion::rand_text_alpha_range(6, 12)),
                evasion::rand_text_alphanumeric(rng.gen_range(8..=20)),
            ));
        }
    }

    let folding = config.get_bool("header_folding");
    for (name, value) in &headers {
        ensure_wire_clean("header name", name)?;
        if value.contains('\r') || value.contains('\n') {
            return Err(Error::Encode(format!(
                "header {name:?} value must not contain CR/LF"
            )));
        }
        if folding {
            out.put_slice(format!("{name}:\r\n {value}\r\n").as_bytes());
        } else {
            out.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
    }
    if let Some(raw) = &spec.raw_headers {
        out.put_slice(raw.as_bytes());
    }
    out.put_slice(b"\r\n");

    if chunked {
        let size = config.get_int("chunked_size").max(1) as usize;
        for chunk in body.chunks(size) {
            out.put_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.put_slice(chunk);
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"0\r\n\r\n");
    } else {
        out.put_slice(&body);
    }

    Ok(out.freeze())
}
