use super::headers::{HeaderMap, RequestHeaders, ResponseHeaders};
use crate::utils::ByteQueue;

/// Caps on one message, from `network.http.*`.
#[derive(Debug, Clone, Copy)]
pub struct BodyLimits {
    pub max_content_length: u64,
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            max_content_length: 1048576,
        }
    }
}

const MAX_HEADER_BLOCK: usize = 0x10000;
const MAX_HEADER_FIELDS: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum HttpParserError {
    #[error("malformed HTTP message: {0}")]
    Malformed(&'static str),

    #[error("header block too large")]
    HeadersTooLarge,

    #[error("invalid content length")]
    BadContentLength,

    #[error("content length exceeds limit")]
    ContentTooLarge,

    #[error("unsupported transfer encoding")]
    BadTransferEncoding,
}

impl HttpParserError {
    /// The status code a server should reply with.
    pub fn status(&self) -> u16 {
        match self {
            HttpParserError::HeadersTooLarge => 431,
            HttpParserError::ContentTooLarge => 413,
            HttpParserError::BadTransferEncoding => 501,
            _ => 400,
        }
    }
}

#[derive(Debug)]
enum Framing {
    None,
    Length(u64),
    Chunked(ChunkState),
    /// Responses without explicit framing run until the peer closes.
    UntilEof,
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrLf,
    Trailers,
}

#[derive(Debug)]
enum State {
    Headers,
    Body {
        framing: Framing,
        keep_alive: bool,
        upgrade: bool,
    },
    /// An upgrade completed; residual bytes belong to the new protocol.
    Upgraded,
}

#[derive(Debug)]
pub enum RequestEvent {
    Headers(RequestHeaders),
    Payload(Vec<u8>),
    Finished { keep_alive: bool, upgrade: bool },
}

#[derive(Debug)]
pub enum ResponseEvent {
    Headers(ResponseHeaders),
    Payload(Vec<u8>),
    Finished { keep_alive: bool, upgrade: bool },
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn connection_keep_alive(headers: &HeaderMap, http10: bool) -> bool {
    if headers.contains_token("connection", "close") {
        return false;
    }
    if http10 {
        return headers.contains_token("connection", "keep-alive");
    }
    true
}

fn body_framing(
    headers: &HeaderMap,
    limits: &BodyLimits,
    response_until_eof: bool,
) -> Result<Framing, HttpParserError> {
    if let Some(te) = headers.get("transfer-encoding") {
        if !te.eq_ignore_ascii_case("chunked") {
            return Err(HttpParserError::BadTransferEncoding);
        }
        return Ok(Framing::Chunked(ChunkState::Size));
    }

    if let Some(cl) = headers.get("content-length") {
        let length: u64 = cl
            .trim()
            .parse()
            .map_err(|_| HttpParserError::BadContentLength)?;
        if length > limits.max_content_length {
            return Err(HttpParserError::ContentTooLarge);
        }
        return Ok(if length == 0 {
            Framing::None
        } else {
            Framing::Length(length)
        });
    }

    Ok(if response_until_eof {
        Framing::UntilEof
    } else {
        Framing::None
    })
}

/// Drives `Framing` over the receive queue, appending payload events.
/// Returns `true` when the body is complete.
fn pump_body(
    framing: &mut Framing,
    data: &mut ByteQueue,
    eof: bool,
    limits: &BodyLimits,
    total: &mut u64,
    mut emit: impl FnMut(Vec<u8>),
) -> Result<bool, HttpParserError> {
    loop {
        match framing {
            Framing::None => return Ok(true),

            Framing::Length(remaining) => {
                if data.is_empty() {
                    if eof && *remaining > 0 {
                        return Err(HttpParserError::Malformed("body truncated"));
                    }
                    return Ok(*remaining == 0);
                }
                let take = (data.len() as u64).min(*remaining) as usize;
                emit(data.take(take));
                *remaining -= take as u64;
                *total += take as u64;
                if *remaining == 0 {
                    return Ok(true);
                }
            }

            Framing::UntilEof => {
                if !data.is_empty() {
                    *total += data.len() as u64;
                    if *total > limits.max_content_length {
                        return Err(HttpParserError::ContentTooLarge);
                    }
                    emit(data.take_all());
                }
                return Ok(eof);
            }

            Framing::Chunked(chunk) => match chunk {
                ChunkState::Size => {
                    let slice = data.as_slice();
                    let line_end = match slice.windows(2).position(|w| w == b"\r\n") {
                        Some(pos) => pos,
                        None => {
                            if slice.len() > 18 {
                                return Err(HttpParserError::Malformed("bad chunk size"));
                            }
                            return Ok(false);
                        }
                    };

                    let line = std::str::from_utf8(&slice[..line_end])
                        .map_err(|_| HttpParserError::Malformed("bad chunk size"))?;
                    let digits = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(digits, 16)
                        .map_err(|_| HttpParserError::Malformed("bad chunk size"))?;

                    data.consume(line_end + 2);
                    *chunk = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        *total += size;
                        if *total > limits.max_content_length {
                            return Err(HttpParserError::ContentTooLarge);
                        }
                        ChunkState::Data(size)
                    };
                }

                ChunkState::Data(remaining) => {
                    if data.is_empty() {
                        return Ok(false);
                    }
                    let take = (data.len() as u64).min(*remaining) as usize;
                    emit(data.take(take));
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *chunk = ChunkState::DataCrLf;
                    }
                }

                ChunkState::DataCrLf => {
                    if data.len() < 2 {
                        return Ok(false);
                    }
                    if &data.as_slice()[..2] != b"\r\n" {
                        return Err(HttpParserError::Malformed("missing chunk terminator"));
                    }
                    data.consume(2);
                    *chunk = ChunkState::Size;
                }

                ChunkState::Trailers => {
                    // Trailer fields are skipped; an empty line ends them.
                    let slice = data.as_slice();
                    let line_end = match slice.windows(2).position(|w| w == b"\r\n") {
                        Some(pos) => pos,
                        None => return Ok(false),
                    };
                    let empty = line_end == 0;
                    data.consume(line_end + 2);
                    if empty {
                        return Ok(true);
                    }
                }
            },
        }
    }
}

/// Incremental HTTP/1.1 request parser, for server sessions. Chunked
/// framing is transparent to the upper layer.
#[derive(Debug)]
pub struct RequestParser {
    state: State,
    limits: BodyLimits,
    body_total: u64,
}

impl RequestParser {
    pub fn new(limits: BodyLimits) -> Self {
        Self {
            state: State::Headers,
            limits,
            body_total: 0,
        }
    }

    /// Whether an upgrade has taken effect; once set, this parser no
    /// longer consumes anything.
    pub fn upgraded(&self) -> bool {
        matches!(self.state, State::Upgraded)
    }

    pub fn parse(
        &mut self,
        data: &mut ByteQueue,
        eof: bool,
    ) -> Result<Vec<RequestEvent>, HttpParserError> {
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                State::Upgraded => break,

                State::Headers => {
                    let head_len = match find_header_end(data.as_slice()) {
                        Some(len) => len,
                        None => {
                            if data.len() > MAX_HEADER_BLOCK {
                                return Err(HttpParserError::HeadersTooLarge);
                            }
                            if eof && !data.is_empty() {
                                return Err(HttpParserError::Malformed("truncated headers"));
                            }
                            break;
                        }
                    };

                    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADER_FIELDS];
                    let mut parsed = httparse::Request::new(&mut fields);
                    let status = parsed
                        .parse(&data.as_slice()[..head_len])
                        .map_err(|_| HttpParserError::Malformed("bad request head"))?;
                    if status.is_partial() {
                        return Err(HttpParserError::Malformed("bad request head"));
                    }

                    let mut req = RequestHeaders::new(
                        parsed.method.unwrap_or(""),
                        parsed.path.unwrap_or(""),
                    );
                    for field in parsed.headers.iter() {
                        req.headers.push(
                            field.name,
                            String::from_utf8_lossy(field.value).into_owned(),
                        );
                    }

                    let http10 = parsed.version == Some(0);
                    let keep_alive = connection_keep_alive(&req.headers, http10);
                    let upgrade = req.headers.contains_token("connection", "upgrade")
                        && req.headers.contains("upgrade");
                    let framing = body_framing(&req.headers, &self.limits, false)?;

                    data.consume(head_len);
                    self.body_total = 0;
                    events.push(RequestEvent::Headers(req));
                    self.state = State::Body {
                        framing,
                        keep_alive,
                        upgrade,
                    };
                }

                State::Body {
                    framing,
                    keep_alive,
                    upgrade,
                } => {
                    let complete = pump_body(
                        framing,
                        data,
                        eof,
                        &self.limits,
                        &mut self.body_total,
                        |chunk| events.push(RequestEvent::Payload(chunk)),
                    )?;
                    if !complete {
                        break;
                    }

                    let (keep_alive, upgrade) = (*keep_alive, *upgrade);
                    events.push(RequestEvent::Finished {
                        keep_alive,
                        upgrade,
                    });
                    self.state = if upgrade {
                        State::Upgraded
                    } else {
                        State::Headers
                    };
                    if !keep_alive && !upgrade {
                        break;
                    }
                }
            }
        }

        Ok(events)
    }
}

/// Incremental HTTP/1.1 response parser, for client sessions.
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    limits: BodyLimits,
    body_total: u64,

    /// The next response answers a HEAD request and has no body.
    head_response: bool,
}

impl ResponseParser {
    pub fn new(limits: BodyLimits) -> Self {
        Self {
            state: State::Headers,
            limits,
            body_total: 0,
            head_response: false,
        }
    }

    /// Tells the parser the next response answers a HEAD request.
    pub fn expect_head_response(&mut self) {
        self.head_response = true;
    }

    pub fn upgraded(&self) -> bool {
        matches!(self.state, State::Upgraded)
    }

    pub fn parse(
        &mut self,
        data: &mut ByteQueue,
        eof: bool,
    ) -> Result<Vec<ResponseEvent>, HttpParserError> {
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                State::Upgraded => break,

                State::Headers => {
                    let head_len = match find_header_end(data.as_slice()) {
                        Some(len) => len,
                        None => {
                            if data.len() > MAX_HEADER_BLOCK {
                                return Err(HttpParserError::HeadersTooLarge);
                            }
                            if eof && !data.is_empty() {
                                return Err(HttpParserError::Malformed("truncated headers"));
                            }
                            break;
                        }
                    };

                    let mut fields = [httparse::EMPTY_HEADER; MAX_HEADER_FIELDS];
                    let mut parsed = httparse::Response::new(&mut fields);
                    let status = parsed
                        .parse(&data.as_slice()[..head_len])
                        .map_err(|_| HttpParserError::Malformed("bad response head"))?;
                    if status.is_partial() {
                        return Err(HttpParserError::Malformed("bad response head"));
                    }

                    let code = parsed.code.unwrap_or(0);
                    let mut resp = ResponseHeaders::new(code);
                    resp.reason = parsed.reason.unwrap_or("").to_string();
                    for field in parsed.headers.iter() {
                        resp.headers.push(
                            field.name,
                            String::from_utf8_lossy(field.value).into_owned(),
                        );
                    }

                    let http10 = parsed.version == Some(0);
                    let keep_alive = connection_keep_alive(&resp.headers, http10);
                    let upgrade = code == 101;
                    let bodyless =
                        resp.body_forbidden() || self.head_response || upgrade;

                    // 1xx interim responses other than 101 are skipped.
                    if (100..200).contains(&code) && code != 101 {
                        data.consume(head_len);
                        continue;
                    }

                    // A response with neither Content-Length nor chunked
                    // framing runs to connection close.
                    let framing = if bodyless {
                        Framing::None
                    } else {
                        body_framing(&resp.headers, &self.limits, true)?
                    };

                    data.consume(head_len);
                    self.body_total = 0;
                    self.head_response = false;
                    events.push(ResponseEvent::Headers(resp));
                    self.state = State::Body {
                        framing,
                        keep_alive,
                        upgrade,
                    };
                }

                State::Body {
                    framing,
                    keep_alive,
                    upgrade,
                } => {
                    let complete = pump_body(
                        framing,
                        data,
                        eof,
                        &self.limits,
                        &mut self.body_total,
                        |chunk| events.push(ResponseEvent::Payload(chunk)),
                    )?;
                    if !complete {
                        break;
                    }

                    let (keep_alive, upgrade) = (*keep_alive, *upgrade);
                    events.push(ResponseEvent::Finished {
                        keep_alive,
                        upgrade,
                    });
                    self.state = if upgrade {
                        State::Upgraded
                    } else {
                        State::Headers
                    };
                    if !keep_alive && !upgrade {
                        break;
                    }
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(bytes: &[u8]) -> ByteQueue {
        let mut q = ByteQueue::new();
        q.put(bytes);
        q
    }

    fn collect_request(
        parser: &mut RequestParser,
        data: &mut ByteQueue,
        eof: bool,
    ) -> Vec<RequestEvent> {
        parser.parse(data, eof).expect("parse ok")
    }

    #[test]
    fn test_request_with_content_length() {
        let mut parser = RequestParser::new(BodyLimits::default());
        let mut data = queue(b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");

        let events = collect_request(&mut parser, &mut data, false);
        assert_eq!(events.len(), 3);
        match &events[0] {
            RequestEvent::Headers(req) => {
                assert_eq!(req.method, "POST");
                assert_eq!(req.uri, "/submit");
                assert_eq!(req.headers.get("host"), Some("x"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            RequestEvent::Payload(body) => assert_eq!(body, b"hello"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events[2],
            RequestEvent::Finished {
                keep_alive: true,
                upgrade: false
            }
        ));
        assert!(data.is_empty());
    }

    #[test]
    fn test_request_split_across_rounds() {
        let mut parser = RequestParser::new(BodyLimits::default());
        let mut data = queue(b"GET / HTT");
        assert!(collect_request(&mut parser, &mut data, false).is_empty());

        data.put(b"P/1.1\r\nHost: x\r\n\r\nGET");
        let events = collect_request(&mut parser, &mut data, false);
        assert_eq!(events.len(), 2);

        // Residual bytes of the next pipelined request stay queued.
        assert_eq!(data.as_slice(), b"GET");
    }

    #[test]
    fn test_chunked_request_is_transparent() {
        let mut parser = RequestParser::new(BodyLimits::default());
        let mut data = queue(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        );

        let events = collect_request(&mut parser, &mut data, false);
        let body: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                RequestEvent::Payload(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"Wikipedia");
        assert!(matches!(events.last(), Some(RequestEvent::Finished { .. })));
    }

    #[test]
    fn test_oversize_body_rejected() {
        let mut parser = RequestParser::new(BodyLimits {
            max_content_length: 4,
        });
        let mut data = queue(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789");
        let err = parser.parse(&mut data, false).unwrap_err();
        assert_eq!(err.status(), 413);
    }

    #[test]
    fn test_upgrade_stops_the_parser() {
        let mut parser = RequestParser::new(BodyLimits::default());
        let mut data = queue(
            b"GET /chat HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n\x81\x00",
        );

        let events = collect_request(&mut parser, &mut data, false);
        assert!(matches!(
            events.last(),
            Some(RequestEvent::Finished { upgrade: true, .. })
        ));
        assert!(parser.upgraded());
        // Frame bytes after the upgrade are not consumed.
        assert_eq!(data.as_slice(), b"\x81\x00");
    }

    #[test]
    fn test_response_round_trip() {
        // A response built from a (status, headers, body) triple and
        // parsed back yields an equal triple.
        let mut resp = ResponseHeaders::new(200);
        resp.headers.push("Content-Type", "text/html");
        resp.headers.push("Content-Length", "12");
        let wire = format!("{}Hello, HTTP!", resp.encode());

        let mut parser = ResponseParser::new(BodyLimits::default());
        let mut data = queue(wire.as_bytes());
        let events = parser.parse(&mut data, false).unwrap();

        match &events[0] {
            ResponseEvent::Headers(parsed) => {
                assert_eq!(parsed.status, 200);
                assert_eq!(parsed.reason, "OK");
                assert_eq!(parsed.headers, resp.headers);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[1] {
            ResponseEvent::Payload(body) => assert_eq!(body, b"Hello, HTTP!"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(events[2], ResponseEvent::Finished { .. }));
    }

    #[test]
    fn test_response_until_eof() {
        let mut parser = ResponseParser::new(BodyLimits::default());
        let mut data = queue(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\npartial");

        let events = parser.parse(&mut data, false).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], ResponseEvent::Payload(p) if p == b"partial"));

        let mut rest = queue(b" rest");
        let events = parser.parse(&mut rest, true).unwrap();
        assert!(matches!(&events[0], ResponseEvent::Payload(p) if p == b" rest"));
        assert!(matches!(events[1], ResponseEvent::Finished { .. }));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut parser = ResponseParser::new(BodyLimits::default());
        parser.expect_head_response();
        let mut data = queue(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n");

        let events = parser.parse(&mut data, false).unwrap();
        assert!(matches!(events[1], ResponseEvent::Finished { .. }));
    }
}
