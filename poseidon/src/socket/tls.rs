//! The TLS transport wrapped around a stream socket.
//!
//! All session state lives under the owning socket's re-entrant I/O
//! lock. Ciphertext produced by the session is appended to the socket's
//! ordinary write queue, so throttling and the edge-triggered write
//! guarantee work the same as for plain TCP.

use crate::utils::ByteQueue;
use anyhow::{anyhow, Result};
use rustls::pki_types::ServerName;
use rustls::server::Acceptor;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;

enum TlsState {
    /// Server side, still reading the ClientHello.
    Accepting {
        acceptor: Acceptor,
        base: Arc<ServerConfig>,
    },
    Server(ServerConnection),
    Client(ClientConnection),
    /// A fatal TLS error was observed; only the alert remains to flush.
    Failed,
}

pub(crate) struct TlsChannel {
    state: TlsState,

    /// Plaintext queued while the server side is still accepting.
    pending_plain: Vec<u8>,

    handshake_notified: bool,
}

#[derive(Debug, Default)]
pub(crate) struct TlsReadOutcome {
    pub(crate) eof: bool,
    pub(crate) plaintext: usize,
    pub(crate) handshake_completed: bool,
}

impl TlsChannel {
    pub(crate) fn server(base: Arc<ServerConfig>) -> Self {
        Self {
            state: TlsState::Accepting {
                acceptor: Acceptor::default(),
                base,
            },
            pending_plain: Vec::new(),
            handshake_notified: false,
        }
    }

    pub(crate) fn client(
        config: Arc<ClientConfig>,
        server_name: &str,
        alpn: &[Vec<u8>],
    ) -> Result<Self> {
        let config = if alpn.is_empty() {
            config
        } else {
            // Offered protocols are per-connection; clone the shared
            // context instead of mutating it.
            let mut owned = (*config).clone();
            owned.alpn_protocols = alpn.to_vec();
            Arc::new(owned)
        };

        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| anyhow!("invalid TLS server name '{}': {}", server_name, e))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| anyhow!("could not create TLS client session: {}", e))?;

        Ok(Self {
            state: TlsState::Client(conn),
            pending_plain: Vec::new(),
            handshake_notified: false,
        })
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        match &self.state {
            TlsState::Accepting { .. } => true,
            TlsState::Server(conn) => conn.is_handshaking(),
            TlsState::Client(conn) => conn.is_handshaking(),
            TlsState::Failed => false,
        }
    }

    /// The protocol agreed via ALPN, if any.
    pub(crate) fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match &self.state {
            TlsState::Server(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
            TlsState::Client(conn) => conn.alpn_protocol().map(<[u8]>::to_vec),
            _ => None,
        }
    }

    /// Queues plaintext for transmission. Before the session is
    /// established the bytes buffer; they go out with the first flush
    /// after the handshake.
    pub(crate) fn queue_plaintext(&mut self, data: &[u8]) -> bool {
        match &mut self.state {
            TlsState::Accepting { .. } => {
                self.pending_plain.extend_from_slice(data);
                true
            }
            TlsState::Server(conn) => conn.writer().write_all(data).is_ok(),
            TlsState::Client(conn) => conn.writer().write_all(data).is_ok(),
            TlsState::Failed => false,
        }
    }

    /// Queues a close-notify alert, flushed with the next write round.
    pub(crate) fn send_close_notify(&mut self, write_queue: &mut ByteQueue) {
        match &mut self.state {
            TlsState::Server(conn) => conn.send_close_notify(),
            TlsState::Client(conn) => conn.send_close_notify(),
            _ => return,
        }
        self.write_round(write_queue);
    }

    /// Drives the session's pending output into the write queue.
    pub(crate) fn write_round(&mut self, write_queue: &mut ByteQueue) {
        match &mut self.state {
            TlsState::Server(conn) => {
                while conn.wants_write() {
                    let _ = conn.write_tls(&mut QueueWriter(write_queue));
                }
            }
            TlsState::Client(conn) => {
                while conn.wants_write() {
                    let _ = conn.write_tls(&mut QueueWriter(write_queue));
                }
            }
            _ => (),
        }
    }

    /// One readable round: pull ciphertext from the descriptor, advance
    /// the handshake, and append decrypted bytes to `read_queue`.
    ///
    /// A clean close-notify and an unexpected EOF while reading are
    /// treated the same: end of stream.
    pub(crate) fn read_round(
        &mut self,
        fd: RawFd,
        read_queue: &mut ByteQueue,
        write_queue: &mut ByteQueue,
        on_alpn_request: &mut dyn FnMut(Vec<Vec<u8>>) -> Option<Vec<u8>>,
    ) -> TlsReadOutcome {
        let mut out = TlsReadOutcome::default();

        // Finish accepting first, if applicable.
        if let TlsState::Accepting { .. } = self.state {
            self.drive_accept(fd, write_queue, on_alpn_request, &mut out);
            if out.eof || matches!(self.state, TlsState::Accepting { .. }) {
                return out;
            }
        }

        let was_handshaking = self.is_handshaking();
        let mut reader = FdReader(fd);
        let mut failed = false;

        // ServerConnection and ClientConnection expose the same calls
        // but share no object-safe trait; expand the loop per variant.
        macro_rules! pump {
            ($conn:expr) => {{
                let conn = $conn;
                loop {
                    match conn.read_tls(&mut reader) {
                        Ok(0) => {
                            out.eof = true;
                            break;
                        }
                        Ok(_) => (),
                        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::error!("Error reading TLS socket: {}", e);
                            out.eof = true;
                            break;
                        }
                    }

                    if let Err(e) = conn.process_new_packets() {
                        log::error!("TLS protocol error: {}", e);
                        // Flush the alert, then treat as end of stream.
                        while conn.wants_write() {
                            let _ = conn.write_tls(&mut QueueWriter(write_queue));
                        }
                        failed = true;
                        out.eof = true;
                        break;
                    }

                    let mut scratch = [0u8; 0x4000];
                    loop {
                        match conn.reader().read(&mut scratch) {
                            Ok(0) => {
                                // Clean close-notify.
                                out.eof = true;
                                break;
                            }
                            Ok(n) => {
                                read_queue.put(&scratch[..n]);
                                out.plaintext += n;
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                                out.eof = true;
                                break;
                            }
                            Err(e) => {
                                log::error!("Error decrypting TLS stream: {}", e);
                                out.eof = true;
                                break;
                            }
                        }
                    }

                    if out.eof {
                        break;
                    }
                }
            }};
        }

        match &mut self.state {
            TlsState::Server(conn) => pump!(conn),
            TlsState::Client(conn) => pump!(conn),
            _ => return out,
        }

        if failed {
            self.state = TlsState::Failed;
            return out;
        }

        if was_handshaking && !self.is_handshaking() && !self.handshake_notified {
            self.handshake_notified = true;
            out.handshake_completed = true;
            if !self.pending_plain.is_empty() {
                let pending = std::mem::take(&mut self.pending_plain);
                self.queue_plaintext(&pending);
            }
        }

        self.write_round(write_queue);
        out
    }

    fn drive_accept(
        &mut self,
        fd: RawFd,
        write_queue: &mut ByteQueue,
        on_alpn_request: &mut dyn FnMut(Vec<Vec<u8>>) -> Option<Vec<u8>>,
        out: &mut TlsReadOutcome,
    ) {
        let (mut acceptor, base) = match std::mem::replace(&mut self.state, TlsState::Failed) {
            TlsState::Accepting { acceptor, base } => (acceptor, base),
            other => {
                self.state = other;
                return;
            }
        };

        let mut reader = FdReader(fd);
        loop {
            match acceptor.read_tls(&mut reader) {
                Ok(0) => {
                    out.eof = true;
                    return;
                }
                Ok(_) => (),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.state = TlsState::Accepting { acceptor, base };
                    return;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Error reading TLS ClientHello: {}", e);
                    out.eof = true;
                    return;
                }
            }

            match acceptor.accept() {
                Ok(None) => continue,
                Ok(Some(accepted)) => {
                    let offered: Vec<Vec<u8>> = accepted
                        .client_hello()
                        .alpn()
                        .map(|protos| protos.map(<[u8]>::to_vec).collect())
                        .unwrap_or_default();

                    let config = match on_alpn_request(offered) {
                        Some(selected) => {
                            let mut owned = (*base).clone();
                            owned.alpn_protocols = vec![selected];
                            Arc::new(owned)
                        }
                        None => base,
                    };

                    match accepted.into_connection(config) {
                        Ok(conn) => {
                            self.state = TlsState::Server(conn);
                        }
                        Err((err, mut alert)) => {
                            log::error!("TLS handshake rejected: {}", err);
                            let _ = alert.write(&mut QueueWriter(write_queue));
                            out.eof = true;
                        }
                    }
                    return;
                }
                Err((err, mut alert)) => {
                    log::error!("Malformed TLS ClientHello: {}", err);
                    let _ = alert.write(&mut QueueWriter(write_queue));
                    out.eof = true;
                    return;
                }
            }
        }
    }
}

struct FdReader(RawFd);

impl Read for FdReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let rc = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if rc < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }
}

/// Appends ciphertext to the socket write queue; never fails.
struct QueueWriter<'a>(&'a mut ByteQueue);

impl Write for QueueWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.put(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
