use super::stream::{StreamSession, StreamSocket};
use super::ws_engine::{
    compute_accept_key, parse_deflate_grant, random_handshake_key, WsDeflate, WsEngine, WsEvent,
};
use super::SocketAddress;
use crate::http::{
    BodyLimits, Deflator, Inflator, RequestHeaders, ResponseEvent, ResponseParser, WsOpcode,
};
use crate::socket::ws_server::WsLimits;
use crate::utils::ByteQueue;
use anyhow::Result;
use parking_lot::Mutex;
use rustls::ClientConfig;
use std::sync::Arc;

/// Callbacks of a WebSocket client connection.
pub trait WsClientSession: Send + Sync + Sized + 'static {
    /// The opening handshake completed.
    fn on_open(&self, _sock: &WsClientSocket<Self>) {}

    fn on_text(&self, _sock: &WsClientSocket<Self>, _text: &str) {}

    fn on_binary(&self, _sock: &WsClientSocket<Self>, _data: &[u8]) {}

    fn on_ping(&self, _sock: &WsClientSocket<Self>, _payload: &[u8]) {}

    fn on_pong(&self, _sock: &WsClientSocket<Self>, _payload: &[u8]) {}

    /// A CLOSE frame arrived; it has been acknowledged already.
    fn on_close(&self, _sock: &WsClientSocket<Self>, _status: u16, _reason: &[u8]) {}
}

enum Phase {
    /// Upgrade request not yet sent.
    Idle,
    /// Awaiting the 101 response.
    Handshake(Box<ResponseParser>),
    Open,
    Done,
}

struct WsState {
    phase: Phase,
    engine: WsEngine,
    handshake_key: String,
}

/// Client side of one WebSocket connection; the session part of a
/// [`StreamSocket`].
pub struct WsClient<H: WsClientSession> {
    handler: H,
    host: String,
    path: String,
    state: Mutex<WsState>,
}

pub type WsClientSocket<H> = StreamSocket<WsClient<H>>;

impl<H: WsClientSession> WsClient<H> {
    fn new(host: &str, path: &str, limits: WsLimits, handler: H) -> Self {
        Self {
            handler,
            host: host.to_string(),
            path: path.to_string(),
            state: Mutex::new(WsState {
                phase: Phase::Idle,
                engine: WsEngine::new(
                    true,
                    limits.max_text_message_length,
                    limits.max_binary_message_length,
                ),
                handshake_key: random_handshake_key(),
            }),
        }
    }

    /// Initiates a plain WS connection; the upgrade request goes out as
    /// soon as the transport connects.
    pub fn connect(
        addr: &SocketAddress,
        host: &str,
        path: &str,
        limits: WsLimits,
        handler: H,
    ) -> Result<Arc<WsClientSocket<H>>> {
        StreamSocket::connect(addr, Self::new(host, path, limits, handler))
    }

    /// Initiates a WSS connection verifying `server_name`.
    pub fn connect_tls(
        addr: &SocketAddress,
        server_name: &str,
        tls: Arc<ClientConfig>,
        path: &str,
        limits: WsLimits,
        handler: H,
    ) -> Result<Arc<WsClientSocket<H>>> {
        StreamSocket::connect_tls(
            addr,
            server_name,
            tls,
            &[b"http/1.1".to_vec()],
            Self::new(server_name, path, limits, handler),
        )
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    fn check_grant(&self, resp_headers: &crate::http::HeaderMap) -> Result<(), &'static str> {
        let mut state = self.state.lock();

        if !resp_headers
            .get("upgrade")
            .is_some_and(|u| u.eq_ignore_ascii_case("websocket"))
        {
            return Err("missing `Upgrade: websocket`");
        }

        let expected = compute_accept_key(&state.handshake_key);
        if resp_headers.get("sec-websocket-accept") != Some(expected.as_str()) {
            return Err("`Sec-WebSocket-Accept` mismatch");
        }

        if let Some(extensions) = resp_headers.get("sec-websocket-extensions") {
            match parse_deflate_grant(extensions)? {
                Some(params) => state.engine.enable_deflate(WsDeflate {
                    deflator: Deflator::new(),
                    inflator: Inflator::new(),
                    // Mirror image of the server side.
                    ours_no_takeover: params.client_no_context_takeover,
                    theirs_no_takeover: params.server_no_context_takeover,
                }),
                None => return Err("unrecognised extension granted"),
            }
        }

        state.phase = Phase::Open;
        Ok(())
    }

    fn pump_frames(&self, sock: &WsClientSocket<H>, data: &mut ByteQueue) {
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

impl<H: WsClientSession> WsClientSocket<H> {
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

impl<H: WsClientSession> StreamSession for WsClient<H> {
    fn on_connected(&self, sock: &StreamSocket<Self>) {
        let key = {
            let mut state = self.state.lock();
            if !matches!(state.phase, Phase::Idle) {
                return;
            }
            state.phase = Phase::Handshake(Box::new(ResponseParser::new(BodyLimits {
                max_content_length: 0x1000,
            })));
            state.handshake_key.clone()
        };

        let mut req = RequestHeaders::new("GET", &self.path);
        req.headers.push("Host", &self.host);
        req.headers.push("Upgrade", "websocket");
        req.headers.push("Connection", "Upgrade");
        req.headers.push("Sec-WebSocket-Key", key);
        req.headers.push("Sec-WebSocket-Version", "13");
        req.headers.push(
            "Sec-WebSocket-Extensions",
            "permessage-deflate; client_max_window_bits",
        );
        sock.send(req.encode().as_bytes());
    }

    fn on_stream(&self, sock: &StreamSocket<Self>, data: &mut ByteQueue, eof: bool) {
        let in_handshake = matches!(self.state.lock().phase, Phase::Handshake(_));

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
                        log::error!("Bad WebSocket handshake response: {}", err);
                        sock.shut_down();
                        return;
                    }
                }
            };

            for event in events {
                match event {
                    ResponseEvent::Headers(resp) => {
                        if resp.status != 101 {
                            log::error!(
                                "WebSocket handshake refused with status {}",
                                resp.status
                            );
                            sock.shut_down();
                            return;
                        }
                        if let Err(reason) = self.check_grant(&resp.headers) {
                            log::error!("WebSocket handshake failed: {}", reason);
                            sock.shut_down();
                            return;
                        }
                        self.handler.on_open(sock);
                    }
                    ResponseEvent::Payload(_) | ResponseEvent::Finished { .. } => (),
                }
            }
        }

        if matches!(self.state.lock().phase, Phase::Open) {
            self.pump_frames(sock, data);
        }
    }

    fn on_closed(&self, sock: &StreamSocket<Self>, err: Option<i32>) {
        log::info!(
            "WebSocket connection to `{}` closed: {}",
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
    impl WsClientSession for NullHandler {}

    assert_impl_all!(WsClient<NullHandler>: Send, Sync);
}
