use super::stream::{StreamSession, StreamSocket};
use super::SocketAddress;
use crate::http::{
    BodyLimits, HttpParserError, RequestHeaders, ResponseEvent, ResponseHeaders, ResponseParser,
};
use crate::utils::ByteQueue;
use anyhow::Result;
use parking_lot::Mutex;
use rustls::ClientConfig;
use std::sync::Arc;

/// Callbacks of an HTTP/1.1 client connection, in response order:
/// `on_headers`, zero or more `on_payload_stream`, then `on_finish`.
pub trait HttpClientSession: Send + Sync + Sized + 'static {
    /// The transport is ready; a request may be sent now.
    fn on_connected(&self, _sock: &HttpClientSocket<Self>) {}

    fn on_headers(&self, _sock: &HttpClientSocket<Self>, _resp: &ResponseHeaders) {}

    fn on_payload_stream(&self, _sock: &HttpClientSocket<Self>, _chunk: &[u8]) {}

    /// The response is complete.
    fn on_finish(&self, sock: &HttpClientSocket<Self>, resp: &ResponseHeaders);

    /// The server broke HTTP framing; the connection is going away.
    fn on_error(&self, sock: &HttpClientSocket<Self>, err: &HttpParserError) {
        log::error!(
            "Bad response from `{}`: {}",
            sock.remote_address(),
            err
        );
    }

    /// Bytes following a 101 upgrade.
    fn on_upgraded_stream(&self, sock: &HttpClientSocket<Self>, data: &mut ByteQueue, _eof: bool) {
        data.clear();
        sock.shut_down();
    }

    fn on_closed(&self, _sock: &HttpClientSocket<Self>, _err: Option<i32>) {}
}

struct ParserState {
    parser: ResponseParser,
    current: Option<ResponseHeaders>,
}

/// Client side of one HTTP connection; the session part of a
/// [`StreamSocket`].
pub struct HttpClient<H: HttpClientSession> {
    handler: H,
    state: Mutex<ParserState>,
}

pub type HttpClientSocket<H> = StreamSocket<HttpClient<H>>;

impl<H: HttpClientSession> HttpClient<H> {
    fn new(limits: BodyLimits, handler: H) -> Self {
        Self {
            handler,
            state: Mutex::new(ParserState {
                parser: ResponseParser::new(limits),
                current: None,
            }),
        }
    }

    /// Initiates a plain HTTP connection.
    pub fn connect(
        addr: &SocketAddress,
        limits: BodyLimits,
        handler: H,
    ) -> Result<Arc<HttpClientSocket<H>>> {
        StreamSocket::connect(addr, Self::new(limits, handler))
    }

    /// Initiates an HTTPS connection verifying `server_name`.
    pub fn connect_tls(
        addr: &SocketAddress,
        server_name: &str,
        tls: Arc<ClientConfig>,
        limits: BodyLimits,
        handler: H,
    ) -> Result<Arc<HttpClientSocket<H>>> {
        StreamSocket::connect_tls(
            addr,
            server_name,
            tls,
            &[b"http/1.1".to_vec()],
            Self::new(limits, handler),
        )
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: HttpClientSession> HttpClientSocket<H> {
    /// Sends a request. A `Content-Length` is injected for non-empty
    /// bodies; HEAD requests arm the parser for a bodyless response.
    pub fn http_request(&self, req: &mut RequestHeaders, body: &[u8]) -> bool {
        if !body.is_empty() && !req.headers.contains("content-length") {
            req.headers.push("Content-Length", body.len().to_string());
        }

        if req.method.eq_ignore_ascii_case("HEAD") {
            self.session().state.lock().parser.expect_head_response();
        }

        let mut wire = req.encode().into_bytes();
        wire.extend_from_slice(body);
        self.send(&wire)
    }
}

impl<H: HttpClientSession> StreamSession for HttpClient<H> {
    fn on_connected(&self, sock: &StreamSocket<Self>) {
        self.handler.on_connected(sock);
    }

    fn on_stream(&self, sock: &StreamSocket<Self>, data: &mut ByteQueue, eof: bool) {
        loop {
            {
                let state = self.state.lock();
                if state.parser.upgraded() {
                    break;
                }
            }

            let mut state = self.state.lock();
            let events = match state.parser.parse(data, eof) {
                Ok(events) => events,
                Err(err) => {
                    drop(state);
                    self.handler.on_error(sock, &err);
                    sock.shut_down();
                    return;
                }
            };
            drop(state);

            if events.is_empty() {
                break;
            }

            for event in events {
                match event {
                    ResponseEvent::Headers(resp) => {
                        self.handler.on_headers(sock, &resp);
                        self.state.lock().current = Some(resp);
                    }
                    ResponseEvent::Payload(chunk) => {
                        self.handler.on_payload_stream(sock, &chunk);
                    }
                    ResponseEvent::Finished {
                        keep_alive,
                        upgrade: _,
                    } => {
                        let resp = self
                            .state
                            .lock()
                            .current
                            .take()
                            .unwrap_or_else(|| ResponseHeaders::new(0));
                        self.handler.on_finish(sock, &resp);
                        if !keep_alive {
                            sock.shut_down();
                        }
                    }
                }
            }
        }

        let upgraded = self.state.lock().parser.upgraded();
        if upgraded && (!data.is_empty() || eof) {
            self.handler.on_upgraded_stream(sock, data, eof);
        }
    }

    fn on_closed(&self, sock: &StreamSocket<Self>, err: Option<i32>) {
        self.handler.on_closed(sock, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    struct NullHandler;
    impl HttpClientSession for NullHandler {
        fn on_finish(&self, _sock: &HttpClientSocket<Self>, _resp: &ResponseHeaders) {}
    }

    assert_impl_all!(HttpClient<NullHandler>: Send, Sync);
}
