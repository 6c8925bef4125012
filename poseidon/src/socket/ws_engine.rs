//! Frame-level WebSocket machinery shared by the server and client
//! sessions: message reassembly, control handling, permessage-deflate
//! and close bookkeeping.

use crate::http::{Deflator, Inflator, WsFrameError, WsFrameHeader, WsFrameParser, WsOpcode};
use crate::utils::ByteQueue;
use rand::RngCore;

/// Close codes used by the engine itself.
pub(crate) const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub(crate) const CLOSE_BAD_DATA: u16 = 1007;
pub(crate) const CLOSE_TOO_LARGE: u16 = 1009;

/// No status present in the CLOSE payload.
const CLOSE_NO_STATUS: u16 = 1005;

pub(crate) struct WsDeflate {
    pub(crate) deflator: Deflator,
    pub(crate) inflator: Inflator,

    /// We discard our window after each message.
    pub(crate) ours_no_takeover: bool,

    /// The peer discards its window after each message.
    pub(crate) theirs_no_takeover: bool,
}

#[derive(Debug)]
pub(crate) enum WsEvent {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { status: u16, reason: Vec<u8> },
}

#[derive(Debug, Default)]
pub(crate) struct WsOutcome {
    pub(crate) events: Vec<WsEvent>,
    /// Wire bytes the engine wants transmitted (PONGs, CLOSE echoes).
    pub(crate) replies: Vec<Vec<u8>>,
    /// The connection is finished and should be shut down.
    pub(crate) shutdown: bool,
}

/// A fatal condition; the caller sends a CLOSE with this code and shuts
/// the connection down.
#[derive(Debug)]
pub(crate) struct WsFatal {
    pub(crate) status: u16,
    pub(crate) reason: &'static str,
}

pub(crate) struct WsEngine {
    frames: WsFrameParser,

    /// Reassembly buffer for a fragmented message.
    message: Vec<u8>,
    message_opcode: Option<WsOpcode>,
    message_compressed: bool,

    deflate: Option<WsDeflate>,

    close_sent: bool,
    closed: bool,

    /// Outgoing frames are masked (client side).
    mask_outgoing: bool,

    text_limit: usize,
    binary_limit: usize,
}

impl WsEngine {
    pub(crate) fn new(mask_outgoing: bool, text_limit: usize, binary_limit: usize) -> Self {
        let frame_cap = text_limit.max(binary_limit) as u64;
        Self {
            frames: WsFrameParser::new(frame_cap),
            message: Vec::new(),
            message_opcode: None,
            message_compressed: false,
            deflate: None,
            close_sent: false,
            closed: false,
            mask_outgoing,
            text_limit,
            binary_limit,
        }
    }

    pub(crate) fn enable_deflate(&mut self, deflate: WsDeflate) {
        self.deflate = Some(deflate);
    }

    pub(crate) fn deflate_enabled(&self) -> bool {
        self.deflate.is_some()
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed
    }

    /// Consumes complete frames from the receive queue.
    pub(crate) fn consume(&mut self, data: &mut ByteQueue) -> Result<WsOutcome, WsFatal> {
        let mut out = WsOutcome::default();

        while !self.closed {
            let (header, payload) = match self.frames.next_frame(data) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    return Err(WsFatal {
                        status: match err {
                            WsFrameError::FrameTooLarge => CLOSE_TOO_LARGE,
                            _ => CLOSE_PROTOCOL_ERROR,
                        },
                        reason: "malformed frame",
                    })
                }
            };

            match header.opcode {
                WsOpcode::Text | WsOpcode::Binary => {
                    if self.message_opcode.is_some() {
                        return Err(WsFatal {
                            status: CLOSE_PROTOCOL_ERROR,
                            reason: "data frame inside fragmented message",
                        });
                    }
                    self.message_opcode = Some(header.opcode);
                    self.message_compressed = header.rsv1;
                    if header.rsv1 && self.deflate.is_none() {
                        return Err(WsFatal {
                            status: CLOSE_PROTOCOL_ERROR,
                            reason: "unexpected compressed frame",
                        });
                    }
                    self.append_fragment(payload)?;
                    if header.fin {
                        self.finish_message(&mut out)?;
                    }
                }

                WsOpcode::Continuation => {
                    if self.message_opcode.is_none() {
                        return Err(WsFatal {
                            status: CLOSE_PROTOCOL_ERROR,
                            reason: "continuation without a message",
                        });
                    }
                    self.append_fragment(payload)?;
                    if header.fin {
                        self.finish_message(&mut out)?;
                    }
                }

                // Control frames may interleave with a fragmented
                // message; they never break the fragment chain.
                WsOpcode::Ping => {
                    out.replies
                        .push(self.encode_control(WsOpcode::Pong, &payload));
                    out.events.push(WsEvent::Ping(payload));
                }

                WsOpcode::Pong => {
                    out.events.push(WsEvent::Pong(payload));
                }

                WsOpcode::Close => {
                    let (status, reason) = decode_close_payload(&payload);

                    // Acknowledge once, then tear down. A CLOSE nested
                    // in a fragmented message discards the fragments;
                    // the partial message is never delivered.
                    if !self.close_sent {
                        self.close_sent = true;
                        let mut echo = Vec::with_capacity(2);
                        if status != CLOSE_NO_STATUS {
                            echo.extend_from_slice(&status.to_be_bytes());
                        }
                        out.replies.push(self.encode_control(WsOpcode::Close, &echo));
                    }

                    self.message.clear();
                    self.message_opcode = None;
                    self.closed = true;
                    out.events.push(WsEvent::Close { status, reason });
                    out.shutdown = true;
                }
            }
        }

        Ok(out)
    }

    fn append_fragment(&mut self, payload: Vec<u8>) -> Result<(), WsFatal> {
        let limit = match self.message_opcode {
            Some(WsOpcode::Text) => self.text_limit,
            _ => self.binary_limit,
        };

        if self.message.is_empty() && !payload.is_empty() {
            self.message = payload;
        } else {
            self.message.extend_from_slice(&payload);
        }

        if limit != 0 && self.message.len() > limit {
            Err(WsFatal {
                status: CLOSE_TOO_LARGE,
                reason: "message too large",
            })
        } else {
            Ok(())
        }
    }

    fn finish_message(&mut self, out: &mut WsOutcome) -> Result<(), WsFatal> {
        let opcode = self.message_opcode.take().expect("message in progress");
        let mut whole = std::mem::take(&mut self.message);
        let compressed = std::mem::replace(&mut self.message_compressed, false);

        if compressed {
            let limit = match opcode {
                WsOpcode::Text => self.text_limit,
                _ => self.binary_limit,
            };
            let deflate = self.deflate.as_ref().expect("deflate negotiated");
            whole = deflate
                .inflator
                .inflate_message(&whole, limit)
                .map_err(|_| WsFatal {
                    status: CLOSE_TOO_LARGE,
                    reason: "undecodable compressed message",
                })?;
            if deflate.theirs_no_takeover {
                deflate.inflator.reset();
            }
        }

        match opcode {
            WsOpcode::Text => {
                if std::str::from_utf8(&whole).is_err() {
                    return Err(WsFatal {
                        status: CLOSE_BAD_DATA,
                        reason: "text message is not UTF-8",
                    });
                }
                out.events.push(WsEvent::Text(whole));
            }
            _ => out.events.push(WsEvent::Binary(whole)),
        }
        Ok(())
    }

    /// Encodes a complete data message, compressing when negotiated.
    pub(crate) fn encode_message(&mut self, opcode: WsOpcode, payload: &[u8]) -> Vec<u8> {
        let mut rsv1 = false;
        let mut body = payload.to_vec();

        // Tiny payloads are not worth a deflate block.
        if let Some(deflate) = &self.deflate {
            if payload.len() >= 8 {
                if let Ok(packed) = deflate.deflator.deflate_message(payload) {
                    body = packed;
                    rsv1 = true;
                    if deflate.ours_no_takeover {
                        deflate.deflator.reset();
                    }
                }
            }
        }

        let mut header = WsFrameHeader {
            fin: true,
            rsv1,
            opcode,
            payload_len: body.len() as u64,
            ..Default::default()
        };
        self.apply_mask(&mut header, &mut body)
    }

    /// Encodes a control frame; payloads are capped at 125 bytes, with
    /// longer ones truncated.
    pub(crate) fn encode_control(&mut self, opcode: WsOpcode, payload: &[u8]) -> Vec<u8> {
        let mut body = payload[..payload.len().min(125)].to_vec();
        let mut header = WsFrameHeader {
            fin: true,
            opcode,
            payload_len: body.len() as u64,
            ..Default::default()
        };
        self.apply_mask(&mut header, &mut body)
    }

    /// Encodes the closing frame and marks the close as sent. Returns
    /// `None` if a close has already been sent.
    pub(crate) fn encode_close(&mut self, status: u16, reason: &[u8]) -> Option<Vec<u8>> {
        if self.close_sent {
            return None;
        }
        self.close_sent = true;

        let mut body = Vec::with_capacity(2 + reason.len().min(123));
        body.extend_from_slice(&status.to_be_bytes());
        body.extend_from_slice(&reason[..reason.len().min(123)]);
        Some(self.encode_control(WsOpcode::Close, &body))
    }

    fn apply_mask(&self, header: &mut WsFrameHeader, body: &mut [u8]) -> Vec<u8> {
        if self.mask_outgoing {
            header.mask = true;
            rand::thread_rng().fill_bytes(&mut header.mask_key);
            header.mask_payload(body);
        }

        let mut wire = Vec::with_capacity(body.len() + 14);
        header.encode(&mut wire);
        wire.extend_from_slice(body);
        wire
    }
}

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The `Sec-WebSocket-Accept` value for a handshake key.
pub(crate) fn compute_accept_key(key: &str) -> String {
    use base64::Engine as _;
    use sha1::{Digest, Sha1};

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// A fresh random `Sec-WebSocket-Key`.
pub(crate) fn random_handshake_key() -> String {
    use base64::Engine as _;

    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// permessage-deflate parameters agreed during the handshake, from the
/// perspective of the party that parsed them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeflateParams {
    pub(crate) server_no_context_takeover: bool,
    pub(crate) client_no_context_takeover: bool,
}

/// Picks an acceptable permessage-deflate alternative from a
/// `Sec-WebSocket-Extensions` offer, server side.
///
/// Alternatives demanding a reduced window (`server_max_window_bits`,
/// or `client_max_window_bits` with an explicit value) are skipped, as
/// the deflate streams here always use the full window.
pub(crate) fn accept_deflate_offer(header: &str) -> Option<DeflateParams> {
    'alternative: for alternative in header.split(',') {
        let mut parts = alternative.split(';').map(str::trim);
        if !parts
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case("permessage-deflate"))
        {
            continue;
        }

        let mut params = DeflateParams::default();
        for part in parts {
            let (name, value) = match part.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim())),
                None => (part, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                "client_max_window_bits" if value.is_none() => (),
                _ => continue 'alternative,
            }
        }
        return Some(params);
    }
    None
}

/// Formats the server's granted extension for the 101 response.
pub(crate) fn deflate_response_header(params: &DeflateParams) -> String {
    let mut out = String::from("permessage-deflate");
    if params.server_no_context_takeover {
        out.push_str("; server_no_context_takeover");
    }
    if params.client_no_context_takeover {
        out.push_str("; client_no_context_takeover");
    }
    out
}

/// Parses the server's granted extension on the client side. `Err` for
/// a grant the client cannot honor.
pub(crate) fn parse_deflate_grant(header: &str) -> Result<Option<DeflateParams>, &'static str> {
    let alternative = match header.split(',').next() {
        Some(alternative) => alternative,
        None => return Ok(None),
    };

    let mut parts = alternative.split(';').map(str::trim);
    if !parts
        .next()
        .is_some_and(|name| name.eq_ignore_ascii_case("permessage-deflate"))
    {
        return Ok(None);
    }

    let mut params = DeflateParams::default();
    for part in parts {
        let (name, value) = match part.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (part, None),
        };
        match name.to_ascii_lowercase().as_str() {
            "server_no_context_takeover" => params.server_no_context_takeover = true,
            "client_no_context_takeover" => params.client_no_context_takeover = true,
            // Decoding a reduced peer window needs no special setup.
            "server_max_window_bits" => (),
            "client_max_window_bits" if value.is_none() => (),
            _ => return Err("unsupported permessage-deflate parameter"),
        }
    }
    Ok(Some(params))
}

fn decode_close_payload(payload: &[u8]) -> (u16, Vec<u8>) {
    if payload.len() < 2 {
        return (CLOSE_NO_STATUS, Vec::new());
    }
    (
        u16::from_be_bytes([payload[0], payload[1]]),
        payload[2..].to_vec(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(opcode: WsOpcode, fin: bool, masked: bool, payload: &[u8]) -> Vec<u8> {
        let mut header = WsFrameHeader {
            fin,
            opcode,
            mask: masked,
            mask_key: [9, 8, 7, 6],
            payload_len: payload.len() as u64,
            ..Default::default()
        };
        let mut body = payload.to_vec();
        header.mask_payload(&mut body);
        let mut wire = Vec::new();
        header.encode(&mut wire);
        wire.extend_from_slice(&body);
        wire
    }

    fn engine() -> WsEngine {
        WsEngine::new(false, 0x100000, 0x100000)
    }

    #[test]
    fn test_fragmented_message_with_nested_ping() {
        let mut e = engine();
        let mut data = ByteQueue::new();
        data.put(&frame(WsOpcode::Text, false, true, b"fragmented"));
        data.put(&frame(WsOpcode::Ping, true, true, b"PING"));
        data.put(&frame(WsOpcode::Continuation, false, true, b" text"));
        data.put(&frame(WsOpcode::Continuation, true, true, b" data"));

        let out = e.consume(&mut data).unwrap();
        assert_eq!(out.events.len(), 2);

        // The PING surfaces before the text message completes, and the
        // fragment chain survives it.
        assert!(matches!(&out.events[0], WsEvent::Ping(p) if p == b"PING"));
        assert!(
            matches!(&out.events[1], WsEvent::Text(t) if t == b"fragmented text data")
        );

        // One auto-PONG echoing the payload.
        assert_eq!(out.replies.len(), 1);
        let mut pong = ByteQueue::new();
        pong.put(&out.replies[0]);
        let mut parser = WsFrameParser::new(0);
        let (header, payload) = parser.next_frame(&mut pong).unwrap().unwrap();
        assert_eq!(header.opcode, WsOpcode::Pong);
        assert_eq!(payload, b"PING");
    }

    #[test]
    fn test_nested_close_discards_partial_message() {
        let mut e = engine();
        let mut data = ByteQueue::new();
        data.put(&frame(WsOpcode::Text, false, true, b"fragmented"));
        let mut close_payload = 1001u16.to_be_bytes().to_vec();
        close_payload.extend_from_slice(b"bye");
        data.put(&frame(WsOpcode::Close, true, true, &close_payload));
        data.put(&frame(WsOpcode::Continuation, true, true, b" never"));

        let out = e.consume(&mut data).unwrap();

        // The CLOSE is delivered with its status; the partial text
        // message never surfaces, nor do the remaining fragments.
        assert_eq!(out.events.len(), 1);
        assert!(matches!(
            &out.events[0],
            WsEvent::Close { status: 1001, reason } if reason == b"bye"
        ));
        assert!(out.shutdown);
        assert_eq!(out.replies.len(), 1);
    }

    #[test]
    fn test_close_acknowledged_once() {
        let mut e = engine();
        let mut data = ByteQueue::new();
        data.put(&frame(WsOpcode::Close, true, true, &1000u16.to_be_bytes()));
        let out = e.consume(&mut data).unwrap();
        assert_eq!(out.replies.len(), 1);

        // After the engine closed, nothing more is consumed.
        let mut more = ByteQueue::new();
        more.put(&frame(WsOpcode::Close, true, true, &1000u16.to_be_bytes()));
        let out = e.consume(&mut more).unwrap();
        assert!(out.events.is_empty());
        assert!(out.replies.is_empty());
    }

    #[test]
    fn test_continuation_without_message_is_fatal() {
        let mut e = engine();
        let mut data = ByteQueue::new();
        data.put(&frame(WsOpcode::Continuation, true, true, b"stray"));
        let err = e.consume(&mut data).unwrap_err();
        assert_eq!(err.status, CLOSE_PROTOCOL_ERROR);
    }

    #[test]
    fn test_text_message_must_be_utf8() {
        let mut e = engine();
        let mut data = ByteQueue::new();
        data.put(&frame(WsOpcode::Text, true, true, &[0xFF, 0xFE, 0x00]));
        let err = e.consume(&mut data).unwrap_err();
        assert_eq!(err.status, CLOSE_BAD_DATA);
    }

    #[test]
    fn test_message_size_limit() {
        let mut e = WsEngine::new(false, 8, 8);
        let mut data = ByteQueue::new();
        data.put(&frame(WsOpcode::Text, false, true, b"12345"));
        data.put(&frame(WsOpcode::Continuation, true, true, b"67890"));
        let err = e.consume(&mut data).unwrap_err();
        assert_eq!(err.status, CLOSE_TOO_LARGE);
    }

    #[test]
    fn test_long_ping_payload_truncated_on_send() {
        let mut e = engine();
        let long = vec![b'p'; 200];
        let wire = e.encode_control(WsOpcode::Ping, &long);
        let (header, _) = WsFrameHeader::decode(&wire).unwrap().unwrap();
        assert_eq!(header.payload_len, 125);
    }

    #[test]
    fn test_masked_round_trip_through_engine() {
        // Client-side engine masks; a server-side engine reads it back.
        let mut client = WsEngine::new(true, 0, 0);
        let wire = client.encode_message(WsOpcode::Binary, b"payload");

        let mut server = engine();
        let mut data = ByteQueue::new();
        data.put(&wire);
        let out = server.consume(&mut data).unwrap();
        assert!(matches!(&out.events[0], WsEvent::Binary(p) if p == b"payload"));
    }

    #[test]
    fn test_accept_key_matches_rfc_sample() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_deflate_offer_negotiation() {
        let params = accept_deflate_offer(
            "permessage-deflate; client_no_context_takeover; client_max_window_bits",
        )
        .unwrap();
        assert!(params.client_no_context_takeover);
        assert!(!params.server_no_context_takeover);
        assert_eq!(
            deflate_response_header(&params),
            "permessage-deflate; client_no_context_takeover"
        );

        // A reduced server window cannot be honored; the whole
        // alternative is skipped.
        assert!(accept_deflate_offer("permessage-deflate; server_max_window_bits=10").is_none());

        // Later acceptable alternatives are still considered.
        let params = accept_deflate_offer(
            "permessage-deflate; server_max_window_bits=10, permessage-deflate",
        );
        assert!(params.is_some());

        assert!(accept_deflate_offer("x-webkit-deflate-frame").is_none());
    }

    #[test]
    fn test_deflate_grant_parsing() {
        let params = parse_deflate_grant("permessage-deflate; server_no_context_takeover")
            .unwrap()
            .unwrap();
        assert!(params.server_no_context_takeover);

        assert!(parse_deflate_grant("permessage-deflate; client_max_window_bits=9").is_err());
        assert!(parse_deflate_grant("").unwrap().is_none());
    }

    #[test]
    fn test_compressed_message_round_trip() {
        let mut sender = WsEngine::new(true, 0, 0);
        sender.enable_deflate(WsDeflate {
            deflator: Deflator::new(),
            inflator: Inflator::new(),
            ours_no_takeover: false,
            theirs_no_takeover: false,
        });

        let mut receiver = engine();
        receiver.enable_deflate(WsDeflate {
            deflator: Deflator::new(),
            inflator: Inflator::new(),
            ours_no_takeover: false,
            theirs_no_takeover: false,
        });

        let text = "compressible compressible compressible".repeat(10);
        let wire = sender.encode_message(WsOpcode::Text, text.as_bytes());
        assert!(wire.len() < text.len());

        let mut data = ByteQueue::new();
        data.put(&wire);
        let out = receiver.consume(&mut data).unwrap();
        assert!(matches!(&out.events[0], WsEvent::Text(t) if t == text.as_bytes()));
    }
}
