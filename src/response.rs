use bytes::{BufMut, Bytes, BytesMut};

use crate::conn::PeerInfo;
use crate::headers::HeaderMap;

/// Where the parser is in the response. `Completed` and `Error` are
/// terminal: once reached, further input is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseState {
    AwaitingStatus,
    ProcessingHeader,
    ProcessingBody,
    Completed,
    Error,
}

/// What one `parse` call decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseCode {
    NeedMore,
    Completed,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseError {
    None,
    Truncated,
    Parse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BodyFraming {
    Chunked,
    Counted(usize),
    UntilClose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(usize),
    DataCrlf,
    Trailer,
}

/// A parsed (or in-progress) HTTP/1.x response. Feed bytes with `parse`
/// as they arrive; `finish` signals that the peer closed.
#[derive(Clone, Debug)]
pub struct Response {
    pub proto: String,
    pub version: String,
    pub code: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: BytesMut,
    /// Residual unparsed bytes held between `parse` calls.
    bufq: BytesMut,
    state: ParseState,
    pub max_data: usize,
    pub error: ResponseError,
    framing: Option<BodyFraming>,
    chunk: ChunkPhase,
    /// Uppercased method of the request this response answers; HEAD
    /// suppresses the body.
    orig_method: Option<String>,
    /// The serialized request this response answers, attached by the
    /// transport.
    pub request: Option<Bytes>,
    pub peer: Option<PeerInfo>,
}

impl Response {
    pub fn new(max_data: usize) -> Self {
        Response {
            proto: String::new(),
            version: String::new(),
            code: 0,
            reason: String::new(),
            headers: HeaderMap::new(),
            body: BytesMut::new(),
            bufq: BytesMut::new(),
            state: ParseState::AwaitingStatus,
            max_data,
            error: ResponseError::None,
            framing: None,
            chunk: ChunkPhase::Size,
            orig_method: None,
            request: None,
            peer: None,
        }
    }

    pub fn for_method(max_data: usize, method: Option<&str>) -> Self {
        let mut res = Self::new(max_data);
        res.orig_method = method.map(|m| m.to_ascii_uppercase());
        res
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParseState::Completed
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.headers
            .get("Transfer-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// Whether the server asked for this connection to be torn down.
    pub fn wants_close(&self) -> bool {
        self.headers
            .get("Connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }

    /// Consumes as much of `data` as possible. Terminal states ignore
    /// further input.
    pub fn parse(&mut self, data: &[u8]) -> ParseCode {
        if matches!(self.state, ParseState::Completed | ParseState::Error) {
            return self.code_for_state();
        }
        self.bufq.extend_from_slice(data);
        self.drive()
    }

    /// The transport disconnected. Read-until-close bodies complete;
    /// anything else mid-flight is marked truncated (body) or errored
    /// (status/headers, which callers discard).
    pub fn finish(&mut self) -> ParseCode {
        match self.state {
            ParseState::Completed | ParseState::Error => {}
            ParseState::ProcessingBody => match self.framing {
                Some(BodyFraming::UntilClose) => {
                    self.complete();
                }
                _ => {
                    self.error = ResponseError::Truncated;
                    self.complete();
                }
            },
            ParseState::AwaitingStatus | ParseState::ProcessingHeader => {
                self.state = ParseState::Error;
            }
        }
        self.code_for_state()
    }

    fn code_for_state(&self) -> ParseCode {
        match self.state {
            ParseState::Completed => ParseCode::Completed,
            ParseState::Error => ParseCode::Error,
            _ => ParseCode::NeedMore,
        }
    }

    fn fail(&mut self) -> ParseCode {
        self.state = ParseState::Error;
        self.error = ResponseError::Parse;
        self.bufq.clear();
        ParseCode::Error
    }

    fn complete(&mut self) {
        self.state = ParseState::Completed;
        if !self.bufq.is_empty() {
            tracing::debug!(
                residual = self.bufq.len(),
                "dropping bytes past the end of a framed body"
            );
            self.bufq.clear();
        }
    }

    /// Completes a response that has no body by definition. Any residual
    /// bytes become the `body` so interim responses (100 Continue) that
    /// arrive glued to the real response can be re-parsed by the caller.
    fn complete_bodyless(&mut self) {
        self.state = ParseState::Completed;
        if !self.bufq.is_empty() {
            let residue = self.bufq.split();
            self.body.extend_from_slice(&residue);
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.bufq.iter().position(|&b| b == b'\n')?;
        let line = self.bufq.split_to(pos + 1);
        let mut line = &line[..pos];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        Some(String::from_utf8_lossy(line).into_owned())
    }

    fn drive(&mut self) -> ParseCode {
        loop {
            match self.state {
                ParseState::AwaitingStatus => {
                    let Some(line) = self.take_line() else {
                        return ParseCode::NeedMore;
                    };
                    if !self.parse_status_line(&line) {
                        return self.fail();
                    }
                    self.state = ParseState::ProcessingHeader;
                }
                ParseState::ProcessingHeader => {
                    let Some(line) = self.take_line() else {
                        return ParseCode::NeedMore;
                    };
                    if line.is_empty() {
                        self.begin_body();
                        if self.state == ParseState::Completed {
                            return ParseCode::Completed;
                        }
                        continue;
                    }
                    if line.starts_with(' ') || line.starts_with('\t') {
                        self.headers.fold_continuation(&line);
                    } else if let Some((name, value)) = line.split_once(':') {
                        self.headers
                            .append(name.trim().to_string(), value.trim().to_string());
                    } else {
                        return self.fail();
                    }
                }
                ParseState::ProcessingBody => return self.parse_body(),
                ParseState::Completed => return ParseCode::Completed,
                ParseState::Error => return ParseCode::Error,
            }
        }
    }

    fn parse_status_line(&mut self, line: &str) -> bool {
        let mut fields = line.splitn(3, ' ');
        let Some(protover) = fields.next() else {
            return false;
        };
        let Some((proto, version)) = protover.split_once('/') else {
            return false;
        };
        if proto != "HTTP" || version.is_empty() {
            return false;
        }
        let Some(code) = fields.next().and_then(|c| c.parse::<u16>().ok()) else {
            return false;
        };
        self.proto = proto.to_string();
        self.version = version.to_string();
        self.code = code;
        self.reason = fields.next().unwrap_or("").to_string();
        true
    }

    fn begin_body(&mut self) {
        let bodyless = (100..200).contains(&self.code)
            || self.code == 204
            || self.code == 304
            || self.orig_method.as_deref() == Some("HEAD");
        if bodyless {
            self.complete_bodyless();
            return;
        }
        self.framing = Some(if self.is_chunked() {
            self.chunk = ChunkPhase::Size;
            BodyFraming::Chunked
        } else if let Some(n) = self.content_length() {
            BodyFraming::Counted(n)
        } else {
            BodyFraming::UntilClose
        });
        self.state = ParseState::ProcessingBody;
        if let Some(BodyFraming::Counted(0)) = self.framing {
            self.complete();
        }
    }

    /// True when the body hit `max_data`; the response completes with the
    /// accumulated prefix.
    fn append_capped(&mut self, data: &[u8]) -> bool {
        let room = self.max_data.saturating_sub(self.body.len());
        if data.len() >= room {
            self.body.put_slice(&data[..room]);
            self.complete();
            return true;
        }
        self.body.put_slice(data);
        false
    }

    fn parse_body(&mut self) -> ParseCode {
        match self.framing {
            Some(BodyFraming::Counted(left)) => {
                let take = left.min(self.bufq.len());
                let data = self.bufq.split_to(take);
                if self.append_capped(&data) {
                    return ParseCode::Completed;
                }
                let left = left - take;
                self.framing = Some(BodyFraming::Counted(left));
                if left == 0 {
                    self.complete();
                    return ParseCode::Completed;
                }
                ParseCode::NeedMore
            }
            Some(BodyFraming::UntilClose) => {
                let data = self.bufq.split();
                if self.append_capped(&data) {
                    return ParseCode::Completed;
                }
                ParseCode::NeedMore
            }
            Some(BodyFraming::Chunked) => self.parse_chunked(),
            None => self.fail(),
        }
    }

    fn parse_chunked(&mut self) -> ParseCode {
        loop {
            match self.chunk {
                ChunkPhase::Size => {
                    let Some(line) = self.take_line() else {
                        return ParseCode::NeedMore;
                    };
                    let size_field = line.split(';').next().unwrap_or("").trim();
                    let Ok(size) = usize::from_str_radix(size_field, 16) else {
                        return self.fail();
                    };
                    self.chunk = if size == 0 {
                        ChunkPhase::Trailer
                    } else {
                        ChunkPhase::Data(size)
                    };
                }
                ChunkPhase::Data(left) => {
                    let take = left.min(self.bufq.len());
                    let data = self.bufq.split_to(take);
                    if self.append_capped(&data) {
                        return ParseCode::Completed;
                    }
                    let left = left - take;
                    if left > 0 {
                        self.chunk = ChunkPhase::Data(left);
                        return ParseCode::NeedMore;
                    }
                    self.chunk = ChunkPhase::DataCrlf;
                }
                ChunkPhase::DataCrlf => {
                    let Some(line) = self.take_line() else {
                        return ParseCode::NeedMore;
                    };
                    if !line.is_empty() {
                        return self.fail();
                    }
                    self.chunk = ChunkPhase::Size;
                }
                ChunkPhase::Trailer => {
                    let Some(line) = self.take_line() else {
                        return ParseCode::NeedMore;
                    };
                    if line.is_empty() {
                        self.complete();
                        return ParseCode::Completed;
                    }
                    if line.starts_with(' ') || line.starts_with('\t') {
                        self.headers.fold_continuation(&line);
                    } else if let Some((name, value)) = line.split_once(':') {
                        self.headers
                            .append(name.trim().to_string(), value.trim().to_string());
                    } else {
                        return self.fail();
                    }
                }
            }
        }
    }

    /// Re-serializes the response: status line, headers in arrival order,
    /// blank line, body bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128 + self.body.len());
        let proto = if self.proto.is_empty() { "HTTP" } else { &self.proto };
        let mut line = format!("{}/{} {}", proto, self.version, self.code);
        if !self.reason.is_empty() {
            line.push(' ');
            line.push_str(&self.reason);
        }
        line.push_str("\r\n");
        out.put_slice(line.as_bytes());
        for (name, value) in self.headers.iter() {
            out.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.put_slice(b"\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }
}
