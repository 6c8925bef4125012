//! HTTP/1.1 and WebSocket wire formats.
//!
//! The parsers are incremental: they consume what they can from the
//! receive queue and leave residual bytes for the next readable round.

mod deflate;
pub use deflate::{Deflator, Inflator};

mod headers;
pub use headers::{HeaderMap, RequestHeaders, ResponseHeaders};

mod parser;
pub use parser::{
    BodyLimits, HttpParserError, RequestEvent, RequestParser, ResponseEvent, ResponseParser,
};

mod ws_frame;
pub use ws_frame::{WsFrameError, WsFrameHeader, WsFrameParser, WsOpcode};

/// Formats a date in IMF-fixdate form for `Date` headers.
pub fn http_date_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// The canonical reason phrase for a status code.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
