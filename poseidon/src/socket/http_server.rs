use super::stream::{StreamSession, StreamSocket};
use crate::http::{
    http_date_now, BodyLimits, RequestEvent, RequestHeaders, RequestParser, ResponseHeaders,
};
use crate::utils::ByteQueue;
use parking_lot::Mutex;
use rustls::ServerConfig;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Callbacks of an HTTP/1.1 server connection, in request order:
/// `on_headers`, zero or more `on_payload_stream`, then `on_finish`,
/// or `on_error` with a suggested status on a protocol violation.
pub trait HttpServerSession: Send + Sync + Sized + 'static {
    fn on_headers(&self, _sock: &HttpServerSocket<Self>, _req: &RequestHeaders) {}

    fn on_payload_stream(&self, _sock: &HttpServerSocket<Self>, _chunk: &[u8]) {}

    /// The request is complete; the session should respond.
    fn on_finish(&self, sock: &HttpServerSocket<Self>, req: &RequestHeaders);

    /// A malformed or oversized request. The default replies with a
    /// minimal error page and shuts the connection down.
    fn on_error(&self, sock: &HttpServerSocket<Self>, status: u16) {
        let mut resp = ResponseHeaders::new(status);
        resp.headers.push("Connection", "close");
        sock.http_response(&mut resp, &[]);
        sock.shut_down();
    }

    /// Bytes following a successful protocol upgrade. The default
    /// closes the connection: plain HTTP sessions do not upgrade.
    fn on_upgraded_stream(&self, sock: &HttpServerSocket<Self>, data: &mut ByteQueue, _eof: bool) {
        data.clear();
        sock.shut_down();
    }
}

struct ParserState {
    parser: RequestParser,
    current: Option<RequestHeaders>,
}

/// Server side of one HTTP connection; the session part of a
/// [`StreamSocket`].
pub struct HttpServer<H: HttpServerSession> {
    handler: H,
    state: Mutex<ParserState>,
}

pub type HttpServerSocket<H> = StreamSocket<HttpServer<H>>;

impl<H: HttpServerSession> HttpServer<H> {
    fn new(limits: BodyLimits, handler: H) -> Self {
        Self {
            handler,
            state: Mutex::new(ParserState {
                parser: RequestParser::new(limits),
                current: None,
            }),
        }
    }

    /// Wraps an accepted plain-TCP descriptor.
    pub fn accept(fd: OwnedFd, limits: BodyLimits, handler: H) -> Arc<HttpServerSocket<H>> {
        StreamSocket::from_accepted(fd, Self::new(limits, handler))
    }

    /// Wraps an accepted descriptor with a TLS server handshake (HTTPS).
    pub fn accept_tls(
        fd: OwnedFd,
        tls: Arc<ServerConfig>,
        limits: BodyLimits,
        handler: H,
    ) -> Arc<HttpServerSocket<H>> {
        StreamSocket::from_accepted_tls(fd, tls, Self::new(limits, handler))
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: HttpServerSession> HttpServerSocket<H> {
    /// Sends a response. A `Content-Length` and `Date` are injected
    /// unless already present; bodyless statuses never carry one.
    pub fn http_response(&self, resp: &mut ResponseHeaders, body: &[u8]) -> bool {
        if !resp.headers.contains("date") {
            resp.headers.push("Date", http_date_now());
        }
        if !resp.body_forbidden()
            && !resp.headers.contains("content-length")
            && !resp.headers.contains_token("transfer-encoding", "chunked")
        {
            resp.headers.push("Content-Length", body.len().to_string());
        }

        let mut wire = resp.encode().into_bytes();
        if !resp.body_forbidden() {
            wire.extend_from_slice(body);
        }
        self.send(&wire)
    }
}

impl<H: HttpServerSession> StreamSession for HttpServer<H> {
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
                    log::warn!(
                        "Bad request from `{}`: {}",
                        sock.remote_address(),
                        err
                    );
                    self.handler.on_error(sock, err.status());
                    return;
                }
            };
            drop(state);

            if events.is_empty() {
                break;
            }

            for event in events {
                match event {
                    RequestEvent::Headers(req) => {
                        self.handler.on_headers(sock, &req);
                        self.state.lock().current = Some(req);
                    }
                    RequestEvent::Payload(chunk) => {
                        self.handler.on_payload_stream(sock, &chunk);
                    }
                    RequestEvent::Finished {
                        keep_alive,
                        upgrade: _,
                    } => {
                        let req = self.state.lock().current.take().unwrap_or_default();
                        self.handler.on_finish(sock, &req);
                        if !keep_alive {
                            sock.shut_down();
                        }
                    }
                }
            }
        }

        // After an upgrade the parser is out of the way; residual bytes
        // belong to the next protocol.
        let upgraded = self.state.lock().parser.upgraded();
        if upgraded && (!data.is_empty() || eof) {
            self.handler.on_upgraded_stream(sock, data, eof);
        }
    }

    fn on_closed(&self, sock: &StreamSocket<Self>, err: Option<i32>) {
        log::info!(
            "HTTP connection from `{}` closed: {}",
            sock.remote_address(),
            super::stream::describe_errno(err)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    struct NullHandler;
    impl HttpServerSession for NullHandler {
        fn on_finish(&self, _sock: &HttpServerSocket<Self>, _req: &RequestHeaders) {}
    }

    assert_impl_all!(HttpServer<NullHandler>: Send, Sync);
}
