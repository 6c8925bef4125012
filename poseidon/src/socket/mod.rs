//! Sockets and their protocol sessions.
//!
//! Every connection-oriented socket shares one [`SocketCore`]; the
//! network driver sees them uniformly through [`AbstractSocket`].
//! Stream sockets carry an optional TLS transport and a protocol
//! session (raw bytes, HTTP, WebSocket) layered on top.

pub mod addr;
pub use addr::{IpAddressClass, SocketAddress};

mod core;
pub use self::core::{SocketCore, SocketState};

pub mod http_client;
pub use http_client::{HttpClient, HttpClientSession, HttpClientSocket};

pub mod http_server;
pub use http_server::{HttpServer, HttpServerSession, HttpServerSocket};

pub mod listen;
pub use listen::ListenSocket;

pub mod stream;
pub use stream::{StreamSession, StreamSocket};

pub(crate) mod tls;

pub mod udp;
pub use udp::{UdpSession, UdpSocket};

pub mod ws_client;
pub use ws_client::{WsClient, WsClientSession, WsClientSocket};

pub(crate) mod ws_engine;

pub mod ws_server;
pub use ws_server::{WsLimits, WsServer, WsServerSession, WsServerSocket};

/// The network driver's view of a socket.
///
/// Callbacks run on the network thread, one event at a time per socket;
/// within one readiness round out-of-band data is delivered before
/// normal reads, which precede writes.
pub trait AbstractSocket: Send + Sync + 'static {
    fn core(&self) -> &SocketCore;

    fn on_oob_readable(&self);

    fn on_readable(&self);

    fn on_writable(&self);

    /// Fired exactly once over a socket's lifetime, with the OS error
    /// that closed it, if any.
    fn on_closed(&self, err: Option<i32>);
}
