use super::core::{IoBuffers, SocketCore};
use super::tls::TlsChannel;
use super::{AbstractSocket, SocketAddress, SocketState};
use crate::utils::callback::run_callback;
use crate::utils::ByteQueue;
use anyhow::{anyhow, Result};
use parking_lot::ReentrantMutexGuard;
use rustls::{ClientConfig, ServerConfig};
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Protocol layer of a stream socket.
///
/// Callbacks run on the network thread with the socket's I/O lock held;
/// they may call `send`, `send_oob` and `shut_down` on the socket
/// freely. A panic escaping a callback shuts the connection down.
pub trait StreamSession: Send + Sync + Sized + 'static {
    /// The connection has been fully established. For TLS sockets this
    /// fires after the handshake, not after the TCP connect.
    fn on_connected(&self, sock: &StreamSocket<Self>) {
        log::debug!("Connection to `{}` established", sock.remote_address());
    }

    /// Bytes have arrived, or the peer finished the stream. The session
    /// may consume any prefix of `data`; the rest stays queued for the
    /// next round.
    fn on_stream(&self, sock: &StreamSocket<Self>, data: &mut ByteQueue, eof: bool);

    fn on_oob_byte(&self, sock: &StreamSocket<Self>, byte: u8) {
        log::info!(
            "Connection to `{}` received out-of-band byte {:#04x}",
            sock.remote_address(),
            byte
        );
    }

    fn on_closed(&self, sock: &StreamSocket<Self>, err: Option<i32>) {
        log::info!(
            "Connection to `{}` closed: {}",
            sock.remote_address(),
            describe_errno(err)
        );
    }

    /// TLS servers only: pick one of the peer's offered ALPN protocols.
    ///
    /// Runs in the middle of the handshake; it must only inspect the
    /// offer and return a choice, not perform I/O on the socket.
    fn on_alpn_request(
        &self,
        _sock: &StreamSocket<Self>,
        _offered: Vec<Vec<u8>>,
    ) -> Option<Vec<u8>> {
        None
    }
}

pub(crate) fn describe_errno(err: Option<i32>) -> String {
    match err {
        Some(0) | None => "end of stream".to_string(),
        Some(errno) => std::io::Error::from_raw_os_error(errno).to_string(),
    }
}

/// A connection-oriented socket carrying a protocol session, over plain
/// TCP or TLS.
pub struct StreamSocket<S: StreamSession> {
    core: SocketCore,
    session: S,
}

impl<S: StreamSession> StreamSocket<S> {
    /// Initiates a TCP connection to `addr`.
    ///
    /// Register the result with the network driver to start I/O.
    pub fn connect(addr: &SocketAddress, session: S) -> Result<Arc<Self>> {
        let core = SocketCore::new_socket(libc::SOCK_STREAM, libc::IPPROTO_TCP)?;
        set_nodelay(&core);

        let sa = addr.to_sockaddr_in6();
        let rc = unsafe {
            libc::connect(
                core.raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(anyhow!("failed to initiate connection to `{}`: {}", addr, err));
            }
        }

        Ok(Arc::new(Self { core, session }))
    }

    /// Initiates a TLS connection to `addr`, verifying `server_name`.
    pub fn connect_tls(
        addr: &SocketAddress,
        server_name: &str,
        config: Arc<ClientConfig>,
        alpn: &[Vec<u8>],
        session: S,
    ) -> Result<Arc<Self>> {
        let sock = Self::connect(addr, session)?;
        let channel = TlsChannel::client(config, server_name, alpn)?;
        *sock.core.lock_io().tls.borrow_mut() = Some(channel);
        Ok(sock)
    }

    /// Wraps a descriptor produced by `accept`.
    pub fn from_accepted(fd: OwnedFd, session: S) -> Arc<Self> {
        let core = SocketCore::from_owned_fd(fd);
        set_nodelay(&core);
        Arc::new(Self { core, session })
    }

    /// Wraps an accepted descriptor and starts a TLS server handshake
    /// with the given default context.
    pub fn from_accepted_tls(fd: OwnedFd, base: Arc<ServerConfig>, session: S) -> Arc<Self> {
        let sock = Self::from_accepted(fd, session);
        *sock.core.lock_io().tls.borrow_mut() = Some(TlsChannel::server(base));
        sock
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn local_address(&self) -> SocketAddress {
        self.core.local_address()
    }

    pub fn remote_address(&self) -> SocketAddress {
        self.core.remote_address()
    }

    /// The ALPN protocol negotiated on a TLS socket.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        let guard = self.core.lock_io();
        let tls = guard.tls.borrow();
        tls.as_ref().and_then(TlsChannel::alpn_protocol)
    }

    /// Queues `data` for transmission, writing as much as the kernel
    /// accepts right away.
    ///
    /// Returns `false` when the socket is closing or closed, or when a
    /// transport error destroys the connection.
    pub fn send(&self, data: &[u8]) -> bool {
        if self.core.state() >= SocketState::Closing {
            return false;
        }

        let guard = self.core.lock_io();
        let has_tls = guard.tls.borrow().is_some();

        if has_tls {
            {
                let mut tls = guard.tls.borrow_mut();
                let channel = tls.as_mut().expect("TLS channel present");
                if !channel.queue_plaintext(data) {
                    return false;
                }
                if channel.is_handshaking() {
                    // Buffered; goes out with the handshake flush.
                    return true;
                }
                let mut wq = guard.write.borrow_mut();
                channel.write_round(&mut wq);
            }
            self.drain_write_queue(&guard)
        } else {
            let mut wq = guard.write.borrow_mut();
            if !wq.is_empty() {
                // The writable event will drain this later.
                wq.put(data);
                return true;
            }

            // Write as much as possible right now. Essential for
            // edge-triggered readiness to work reliably.
            let mut nskip = 0usize;
            while nskip < data.len() {
                let rc = unsafe {
                    libc::send(
                        self.core.raw_fd(),
                        data[nskip..].as_ptr() as *const libc::c_void,
                        data.len() - nskip,
                        libc::MSG_NOSIGNAL,
                    )
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => break,
                        Some(libc::EINTR) => continue,
                        _ => {
                            log::error!(
                                "Error writing to `{}`: {}",
                                self.remote_address(),
                                err
                            );
                            drop(wq);
                            self.core.quick_shut_down();
                            return false;
                        }
                    }
                }
                nskip += rc as usize;
            }

            wq.put(&data[nskip..]);
            true
        }
    }

    /// Sends one out-of-band byte; best-effort.
    pub fn send_oob(&self, byte: u8) -> bool {
        unsafe {
            libc::send(
                self.core.raw_fd(),
                &byte as *const u8 as *const libc::c_void,
                1,
                libc::MSG_OOB,
            ) > 0
        }
    }

    /// Initiates a graceful shutdown.
    ///
    /// If data is still queued on an established connection, the socket
    /// enters `Closing` and the queue drains before the actual
    /// shutdown; otherwise the shutdown happens immediately.
    pub fn shut_down(&self) -> bool {
        let guard = self.core.lock_io();

        {
            let mut tls = guard.tls.borrow_mut();
            if let Some(channel) = tls.as_mut() {
                let mut wq = guard.write.borrow_mut();
                channel.send_close_notify(&mut wq);
            }
        }

        let pending = !guard.write.borrow().is_empty();
        if pending
            && self
                .core
                .set_state_if(SocketState::Established, SocketState::Closing)
        {
            return true;
        }

        self.core.advance_state(SocketState::Closed);
        unsafe { libc::shutdown(self.core.raw_fd(), libc::SHUT_RDWR) == 0 }
    }

    /// Drains the write queue into the kernel until empty or blocked.
    fn drain_write_queue(&self, guard: &ReentrantMutexGuard<'_, IoBuffers>) -> bool {
        let mut wq = guard.write.borrow_mut();
        loop {
            if wq.is_empty() {
                return true;
            }

            let rc = unsafe {
                libc::send(
                    self.core.raw_fd(),
                    wq.as_slice().as_ptr() as *const libc::c_void,
                    wq.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return true,
                    Some(libc::EINTR) => continue,
                    _ => {
                        log::error!("Error writing to `{}`: {}", self.remote_address(), err);
                        drop(wq);
                        self.core.quick_shut_down();
                        return false;
                    }
                }
            }
            wq.consume(rc as usize);
        }
    }

    fn plain_readable(&self, guard: &ReentrantMutexGuard<'_, IoBuffers>) {
        let mut eof = false;
        let mut received = 0usize;

        {
            let mut rq = guard.read.borrow_mut();
            let mut scratch = [0u8; 0xFFFF];
            loop {
                let rc = unsafe {
                    libc::recv(
                        self.core.raw_fd(),
                        scratch.as_mut_ptr() as *mut libc::c_void,
                        scratch.len(),
                        0,
                    )
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EAGAIN) => break,
                        Some(libc::EINTR) => continue,
                        _ => {
                            log::error!(
                                "Error reading from `{}`: {}",
                                self.remote_address(),
                                err
                            );
                            drop(rq);
                            self.core.quick_shut_down();
                            return;
                        }
                    }
                }
                if rc == 0 {
                    eof = true;
                    break;
                }
                rq.put(&scratch[..rc as usize]);
                received += rc as usize;
            }
        }

        if received > 0 || eof {
            self.dispatch_stream(guard, eof);
        }

        if eof {
            // Half-open connections are not supported.
            log::info!("Closing connection: remote = {}", self.remote_address());
            unsafe {
                libc::shutdown(self.core.raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    fn tls_readable(&self, guard: &ReentrantMutexGuard<'_, IoBuffers>) {
        let outcome = {
            let mut tls = guard.tls.borrow_mut();
            let channel = tls.as_mut().expect("TLS channel present");
            let mut rq = guard.read.borrow_mut();
            let mut wq = guard.write.borrow_mut();
            let mut alpn = |offered: Vec<Vec<u8>>| self.session.on_alpn_request(self, offered);
            channel.read_round(self.core.raw_fd(), &mut rq, &mut wq, &mut alpn)
        };

        if outcome.handshake_completed
            && self
                .core
                .set_state_if(SocketState::Pending, SocketState::Established)
        {
            // The session may queue its first bytes from here.
            if !run_callback("connection establishment callback", || {
                self.session.on_connected(self)
            }) {
                self.core.quick_shut_down();
                return;
            }
        }

        if !self.drain_write_queue(guard) {
            return;
        }

        if outcome.plaintext > 0 || outcome.eof {
            self.dispatch_stream(guard, outcome.eof);
        }

        if outcome.eof {
            unsafe {
                libc::shutdown(self.core.raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    fn dispatch_stream(&self, guard: &ReentrantMutexGuard<'_, IoBuffers>, eof: bool) {
        let mut rq = guard.read.borrow_mut();
        if !run_callback("stream data callback", || {
            self.session.on_stream(self, &mut rq, eof)
        }) {
            drop(rq);
            self.core.quick_shut_down();
        }
    }
}

fn set_nodelay(core: &SocketCore) {
    // Errors are ignored.
    let on: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            core.raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

impl<S: StreamSession> AbstractSocket for StreamSocket<S> {
    fn core(&self) -> &SocketCore {
        &self.core
    }

    fn on_oob_readable(&self) {
        let mut byte = 0u8;
        // Without pending OOB data this fails with EINVAL.
        let rc = unsafe {
            libc::recv(
                self.core.raw_fd(),
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_OOB,
            )
        };
        if rc > 0
            && !run_callback("out-of-band data callback", || {
                self.session.on_oob_byte(self, byte)
            })
        {
            self.core.quick_shut_down();
        }
    }

    fn on_readable(&self) {
        let guard = self.core.lock_io();
        let has_tls = guard.tls.borrow().is_some();
        if has_tls {
            self.tls_readable(&guard);
        } else {
            self.plain_readable(&guard);
        }
    }

    fn on_writable(&self) {
        let guard = self.core.lock_io();

        let handshaking = {
            let mut tls = guard.tls.borrow_mut();
            match tls.as_mut() {
                Some(channel) => {
                    let mut wq = guard.write.borrow_mut();
                    channel.write_round(&mut wq);
                    channel.is_handshaking()
                }
                None => false,
            }
        };

        if !self.drain_write_queue(&guard) {
            return;
        }

        // The first writable notification completes establishment; TLS
        // sockets wait for the handshake instead.
        if !handshaking
            && self
                .core
                .set_state_if(SocketState::Pending, SocketState::Established)
        {
            log::debug!("Connection established: remote = {}", self.remote_address());
            if !run_callback("connection establishment callback", || {
                self.session.on_connected(self)
            }) {
                self.core.quick_shut_down();
                return;
            }
            // Flush anything the callback queued through TLS.
            {
                let mut tls = guard.tls.borrow_mut();
                if let Some(channel) = tls.as_mut() {
                    let mut wq = guard.write.borrow_mut();
                    channel.write_round(&mut wq);
                }
            }
            if !self.drain_write_queue(&guard) {
                return;
            }
        }

        if guard.write.borrow().is_empty()
            && self
                .core
                .set_state_if(SocketState::Closing, SocketState::Closed)
        {
            // All pending data sent; complete the deferred shutdown.
            unsafe {
                libc::shutdown(self.core.raw_fd(), libc::SHUT_RDWR);
            }
        }
    }

    fn on_closed(&self, err: Option<i32>) {
        if self.core.take_closed_callback() {
            run_callback("socket closure callback", || {
                self.session.on_closed(self, err)
            });
        }
    }
}

impl<S: StreamSession> std::fmt::Debug for StreamSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSocket").field("core", &self.core).finish()
    }
}
