use super::stream::{StreamSession, StreamSocket};
use super::ws_engine::{
    accept_deflate_offer, compute_accept_key, deflate_response_header, WsDeflate, WsEngine,
    WsEvent,
};
use crate::http::{
    BodyLimits, Deflator, Inflator, RequestEvent, RequestHeaders, RequestParser, ResponseHeaders,
    WsOpcode,
};
use crate::utils::ByteQueue;
use parking_lot::Mutex;
use rustls::ServerConfig;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Message size caps, from `network.http.max_websocket_*`.
#[derive(Debug, Clone, Copy)]
pub struct WsLimits {
    pub max_text_message_length: usize,
    pub max_binary_message_length: usize,
}

impl Default for WsLimits {
    fn default() -> Self {
        Self {
            max_text_message_length: 1048576,
            max_binary_message_length: 1048576,
        }
    }
}

/// Callbacks of a WebSocket server connection. Text and binary events
/// carry complete messages, reassembled across fragments; PINGs are
/// answered automatically before `on_ping` fires.
pub trait WsServerSession: Send + Sync + Sized + 'static {
    /// The opening handshake completed.
    fn on_open(&self, _sock: &WsServerSocket<Self>, _req: &RequestHeaders) {}

    fn on_text(&self, _sock: &WsServerSocket<Self>, _text: &str) {}

    fn on_binary(&self, _sock: &WsServerSocket<Self>, _data: &[u8]) {}

    fn on_ping(&self, _sock: &WsServerSocket<Self>, _payload: &[u8]) {}

    fn on_pong(&self, _sock: &WsServerSocket<Self>, _payload: &[u8]) {}

    /// A CLOSE frame arrived; it has been acknowledged already.
    fn on_close(&self, _sock: &WsServerSocket<Self>, _status: u16, _reason: &[u8]) {}
}

enum Phase {
    Handshake(Box<RequestParser>),
    Open,
    Done,
}

struct WsState {
    phase: Phase,
    engine: WsEngine,
}

/// Server side of one WebSocket connection; the session part of a
/// [`StreamSocket`].
pub struct WsServer<H: WsServerSession> {
    handler: H,
    state: Mutex<WsState>,
}

pub type WsServerSocket<H> = StreamSocket<WsServer<H>>;

impl<H: WsServerSession> WsServer<H> {
    fn new(limits: WsLimits, handler: H) -> Self {
        Self {
            handler,
            state: Mutex::new(WsState {
                phase: Phase::Handshake(Box::new(RequestParser::new(BodyLimits {
                    // The handshake request has no body to speak of.
                    max_content_length: 0x1000,
                }))),
                engine: WsEngine::new(
                    false,
                    limits.max_text_message_length,
                    limits.max_binary_message_length,
                ),
            }),
        }
    }

    /// Wraps an accepted plain-TCP descriptor.
    pub fn accept(fd: OwnedFd, limits: WsLimits, handler: H) -> Arc<WsServerSocket<H>> {
        StreamSocket::from_accepted(fd, Self::new(limits, handler))
    }

    /// Wraps an accepted descriptor with a TLS server handshake (WSS).
    pub fn accept_tls(
        fd: OwnedFd,
        tls: Arc<ServerConfig>,
        limits: WsLimits,
        handler: H,
    ) -> Arc<WsServerSocket<H>> {
        StreamSocket::from_accepted_tls(fd, tls, Self::new(limits, handler))
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn finish_handshake(&self, sock: &WsServerSocket<H>, req: &RequestHeaders) -> bool {
        if !req.method.eq_ignore_ascii_case("GET")
            || !req
                .headers
                .get("upgrade")
                .is_some_and(|u| u.eq_ignore_ascii_case("websocket"))
            || req.headers.get("sec-websocket-version") != Some("13")
        {
            reject(sock, 426);
            return false;
        }
        let key = match req.headers.get("sec-websocket-key") {
            Some(key) => key,
            None => {
                reject(sock, 400);
                return false;
            }
        };

        let mut resp = ResponseHeaders::new(101);
        resp.headers.push("Upgrade", "websocket");
        resp.headers.push("Connection", "Upgrade");
        resp.headers
            .push("Sec-WebSocket-Accept", compute_accept_key(key));

        let deflate = req
            .headers
            .get("sec-websocket-extensions")
            .and_then(accept_deflate_offer);
        if let Some(params) = &deflate {
            resp.headers
                .push("Sec-WebSocket-Extensions", deflate_response_header(params));
        }

        if !sock.send(resp.encode().as_bytes()) {
            return false;
        }

        let mut state = self.state.lock();
        if let Some(params) = deflate {
            state.engine.enable_deflate(WsDeflate {
                deflator: Deflator::new(),
                inflator: Inflator::new(),
                ours_no_takeover: params.server_no_context_takeover,
                theirs_no_takeover: params.client_no_context_takeover,
            });
        }
        state.phase = Phase::Open;
        true
    }

    fn pump_frames(&self, sock: &WsServerSocket<H>, data: &mut ByteQueue) {
        let outcome = {
            let mut state = self.state.lock();
            match state.engine.consume(data) {
                Ok(outcome) => outcome,
                Err(fatal) => {
                    let close = state.engine.encode_close(fatal.status, fatal.reason.as_bytes());
                    state.phase = Phase::Done;
                    drop(state);

                    log::warn!(
                        "WebSocket protocol violation from `{}`: {}",
                        sock.remote_address(),
                        fatal.reason
                    );
                    if let Some(wire) = close {
                        sock.send(&wire);
                    }
                    sock.shut_down();
                    return;
                }
            }
        };

        for wire in &outcome.replies {
            sock.send(wire);
        }

        for event in outcome.events {
            match event {
                WsEvent::Text(text) => {
                    self.handler
                        .on_text(sock, std::str::from_utf8(&text).unwrap_or_default());
                }
                WsEvent::Binary(data) => self.handler.on_binary(sock, &data),
                WsEvent::Ping(payload) => self.handler.on_ping(sock, &payload),
                WsEvent::Pong(payload) => self.handler.on_pong(sock, &payload),
                WsEvent::Close { status, reason } => {
                    self.handler.on_close(sock, status, &reason);
                }
            }
        }

        if outcome.shutdown {
            self.state.lock().phase = Phase::Done;
            sock.shut_down();
        }
    }
}

fn reject<H: WsServerSession>(sock: &WsServerSocket<H>, status: u16) {
    let mut resp = ResponseHeaders::new(status);
    resp.headers.push("Connection", "close");
    resp.headers.push("Content-Length", "0");
    sock.send(resp.encode().as_bytes());
    sock.shut_down();
}

impl<H: WsServerSession> WsServerSocket<H> {
    pub fn ws_send_text(&self, text: &str) -> bool {
        self.ws_send(WsOpcode::Text, text.as_bytes())
    }

    pub fn ws_send_binary(&self, data: &[u8]) -> bool {
        self.ws_send(WsOpcode::Binary, data)
    }

    /// Sends a PING; payloads beyond 125 bytes are truncated.
    pub fn ws_ping(&self, payload: &[u8]) -> bool {
        let wire = {
            let mut state = self.session().state.lock();
            if !matches!(state.phase, Phase::Open) {
                return false;
            }
            state.engine.encode_control(WsOpcode::Ping, payload)
        };
        self.send(&wire)
    }

    /// Initiates a closing handshake; reasons beyond 123 bytes are
    /// truncated.
    pub fn ws_close(&self, status: u16, reason: &[u8]) -> bool {
        let wire = {
            let mut state = self.session().state.lock();
            if !matches!(state.phase, Phase::Open) {
                return false;
            }
            state.engine.encode_close(status, reason)
        };
        match wire {
            Some(wire) => {
                let sent = self.send(&wire);
                self.shut_down();
                sent
            }
            None => false,
        }
    }

    fn ws_send(&self, opcode: WsOpcode, payload: &[u8]) -> bool {
        let wire = {
            let mut state = self.session().state.lock();
            if !matches!(state.phase, Phase::Open) || state.engine.closed() {
                return false;
            }
            state.engine.encode_message(opcode, payload)
        };
        self.send(&wire)
    }
}

impl<H: WsServerSession> StreamSession for WsServer<H> {
    fn on_stream(&self, sock: &StreamSocket<Self>, data: &mut ByteQueue, eof: bool) {
        let in_handshake = {
            let state = self.state.lock();
            matches!(state.phase, Phase::Handshake(_))
        };

        if in_handshake {
            let events = {
                let mut state = self.state.lock();
                let parser = match &mut state.phase {
                    Phase::Handshake(parser) => parser,
                    _ => return,
                };
                match parser.parse(data, eof) {
                    Ok(events) => events,
                    Err(err) => {
                        drop(state);
                        reject(sock, err.status());
                        return;
                    }
                }
            };

            let mut pending: Option<RequestHeaders> = None;
            for event in events {
                match event {
                    RequestEvent::Headers(req) => pending = Some(req),
                    RequestEvent::Payload(_) => (),
                    RequestEvent::Finished { upgrade: false, .. } => {
                        reject(sock, 426);
                        return;
                    }
                    RequestEvent::Finished { upgrade: true, .. } => {
                        let req = match pending.take() {
                            Some(req) => req,
                            None => return,
                        };
                        if !self.finish_handshake(sock, &req) {
                            return;
                        }
                        self.handler.on_open(sock, &req);
                    }
                }
            }
        }

        if matches!(self.state.lock().phase, Phase::Open) {
            self.pump_frames(sock, data);
        }
    }

    fn on_closed(&self, sock: &StreamSocket<Self>, err: Option<i32>) {
        log::info!(
            "WebSocket connection from `{}` closed: {}",
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
    impl WsServerSession for NullHandler {}

    assert_impl_all!(WsServer<NullHandler>: Send, Sync);
}
