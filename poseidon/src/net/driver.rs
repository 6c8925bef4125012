use super::slots::SlotTable;
use super::tls::{build_tls_defaults, TlsDefaults};
use crate::config::ConfigFile;
use crate::http::BodyLimits;
use crate::socket::{AbstractSocket, SocketState, WsLimits};
use crate::utils::callback::run_callback;
use anyhow::{anyhow, Context, Result};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use parking_lot::Mutex;
use rustls::{ClientConfig, ServerConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};

const DEFAULT_EVENT_BUFFER_SIZE: usize = 1024;
const DEFAULT_THROTTLE_SIZE: usize = 1048576;

/// How long one poll may block; bounded so shutdown is never delayed
/// longer than this.
const POLL_TIMEOUT_MS: u16 = 5000;

struct DriverConfig {
    event_buffer_size: usize,
    throttle_size: usize,
    tls: TlsDefaults,
    request_limits: BodyLimits,
    response_limits: BodyLimits,
    ws_limits: WsLimits,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            throttle_size: DEFAULT_THROTTLE_SIZE,
            tls: TlsDefaults::default(),
            request_limits: BodyLimits::default(),
            response_limits: BodyLimits::default(),
            ws_limits: WsLimits::default(),
        }
    }
}

fn read_size(file: &ConfigFile, segments: &[&str], default: u64) -> anyhow::Result<u64> {
    let value = file.query(segments)?;
    if let Some(size) = value.as_i64() {
        if size >= 0 {
            return Ok(size as u64);
        }
    }
    if !value.is_null() {
        log::warn!(
            "Ignoring `{}`: expecting a non-negative `integer`, got `{}`",
            segments.join("."),
            value
        );
    }
    Ok(default)
}

fn interest_flags(throttled: bool) -> EpollFlags {
    if throttled {
        // Write-only, level-triggered, until the send queue drains.
        EpollFlags::EPOLLOUT
    } else {
        EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI | EpollFlags::EPOLLOUT | EpollFlags::EPOLLET
    }
}

/// Owns the readiness multiplexer and every registered socket (weakly).
///
/// There is no explicit removal: a socket leaves the driver when the
/// kernel reports hang-up or error on it, or when its last strong
/// reference elsewhere is dropped.
pub struct NetworkDriver {
    epoll: Epoll,
    slots: Mutex<SlotTable>,
    events: Mutex<VecDeque<EpollEvent>>,
    conf: Mutex<DriverConfig>,
}

impl NetworkDriver {
    pub fn new() -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .context("could not create epoll object")?;

        Ok(Self {
            epoll,
            slots: Mutex::new(SlotTable::new()),
            events: Mutex::new(VecDeque::new()),
            conf: Mutex::new(DriverConfig::default()),
        })
    }

    /// Re-reads `network.*` configuration and rebuilds the default TLS
    /// contexts. On error the previous configuration stays in effect.
    pub fn reload(&self, file: &ConfigFile) -> Result<()> {
        let mut event_buffer_size = DEFAULT_EVENT_BUFFER_SIZE as i64;
        let mut throttle_size = DEFAULT_THROTTLE_SIZE as i64;

        let value = file.query(&["network", "poll", "event_buffer_size"])?;
        if let Some(size) = value.as_i64() {
            event_buffer_size = size;
        } else if !value.is_null() {
            log::warn!(
                "Ignoring `network.poll.event_buffer_size`: expecting an `integer`, got `{}`",
                value
            );
        }
        if !(16..=524288).contains(&event_buffer_size) {
            return Err(anyhow!(
                "`network.poll.event_buffer_size` value `{}` out of range",
                event_buffer_size
            ));
        }

        let value = file.query(&["network", "poll", "throttle_size"])?;
        if let Some(size) = value.as_i64() {
            throttle_size = size;
        } else if !value.is_null() {
            log::warn!(
                "Ignoring `network.poll.throttle_size`: expecting an `integer`, got `{}`",
                value
            );
        }
        if !(256..=134217712).contains(&throttle_size) {
            return Err(anyhow!(
                "`network.poll.throttle_size` value `{}` out of range",
                throttle_size
            ));
        }

        let defaults = BodyLimits::default();
        let request_limits = BodyLimits {
            max_content_length: read_size(
                file,
                &["network", "http", "max_request_content_length"],
                defaults.max_content_length,
            )?,
        };
        let response_limits = BodyLimits {
            max_content_length: read_size(
                file,
                &["network", "http", "max_response_content_length"],
                defaults.max_content_length,
            )?,
        };

        let ws_defaults = WsLimits::default();
        let ws_limits = WsLimits {
            max_text_message_length: read_size(
                file,
                &["network", "http", "max_websocket_text_message_length"],
                ws_defaults.max_text_message_length as u64,
            )? as usize,
            max_binary_message_length: read_size(
                file,
                &["network", "http", "max_websocket_binary_message_length"],
                ws_defaults.max_binary_message_length as u64,
            )? as usize,
        };

        let tls = build_tls_defaults(file)?;

        let mut conf = self.conf.lock();
        conf.event_buffer_size = event_buffer_size as usize;
        conf.throttle_size = throttle_size as usize;
        conf.tls = tls;
        conf.request_limits = request_limits;
        conf.response_limits = response_limits;
        conf.ws_limits = ws_limits;
        Ok(())
    }

    /// Body caps for incoming requests, from `network.http.*`.
    pub fn request_body_limits(&self) -> BodyLimits {
        self.conf.lock().request_limits
    }

    /// Body caps for incoming responses, from `network.http.*`.
    pub fn response_body_limits(&self) -> BodyLimits {
        self.conf.lock().response_limits
    }

    /// WebSocket message caps, from `network.http.*`.
    pub fn ws_limits(&self) -> WsLimits {
        self.conf.lock().ws_limits
    }

    /// The default server TLS context, if a certificate is configured.
    pub fn default_server_tls(&self) -> Option<Arc<ServerConfig>> {
        let conf = self.conf.lock();
        if conf.tls.server.is_none() {
            log::warn!("Server TLS context unavailable [certificate not configured]");
        }
        conf.tls.server.clone()
    }

    /// The default client TLS context.
    pub fn default_client_tls(&self) -> Option<Arc<ClientConfig>> {
        let conf = self.conf.lock();
        if conf.tls.client.is_none() {
            log::warn!("Client TLS context unavailable [no configuration loaded]");
        }
        conf.tls.client.clone()
    }

    /// Number of sockets in the registration table.
    pub fn size(&self) -> usize {
        self.slots.lock().len()
    }

    /// Registers a socket for read, write and priority notifications.
    pub fn insert(self: &Arc<Self>, socket: Arc<dyn AbstractSocket>) -> Result<()> {
        let cookie = self.slots.lock().insert(Arc::downgrade(&socket));

        if let Err(err) = socket.core().set_driver(Arc::downgrade(self), cookie) {
            self.slots.lock().remove(cookie);
            return Err(err);
        }

        let event = EpollEvent::new(interest_flags(false), cookie);
        if let Err(errno) = self.epoll.add(socket.core().fd(), event) {
            self.slots.lock().remove(cookie);
            return Err(anyhow!(
                "could not add socket fd {} to epoll: {}",
                socket.core().raw_fd(),
                errno
            ));
        }

        log::trace!(
            "Registered socket fd {} with cookie {:#x}",
            socket.core().raw_fd(),
            cookie
        );
        Ok(())
    }

    /// One iteration of the poll loop: take one event, dispatch it, and
    /// recompute the socket's throttle flag.
    pub fn thread_loop(&self) {
        let (event_buffer_size, throttle_size) = {
            let conf = self.conf.lock();
            (conf.event_buffer_size, conf.throttle_size)
        };

        // Only the network thread consumes the cached batch.
        let event = {
            let mut events = self.events.lock();
            match events.pop_front() {
                Some(event) => event,
                None => {
                    let mut buf = vec![EpollEvent::empty(); event_buffer_size];
                    let n = match self
                        .epoll
                        .wait(&mut buf, EpollTimeout::from(POLL_TIMEOUT_MS))
                    {
                        Ok(n) => n,
                        Err(nix::errno::Errno::EINTR) => return,
                        Err(errno) => {
                            log::error!("epoll wait failed: {}", errno);
                            return;
                        }
                    };
                    if n == 0 {
                        return;
                    }
                    log::trace!("Collected {} socket event(s) from epoll", n);
                    events.extend(buf[..n].iter().copied());
                    events.pop_front().expect("events just added")
                }
            }
        };

        let cookie = event.data();
        let flags = event.events();

        let hangup = flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
        let socket = {
            let mut slots = self.slots.lock();
            let resolved = slots.get(cookie).and_then(Weak::upgrade);
            match resolved {
                Some(socket) => {
                    if hangup {
                        slots.remove(cookie);
                    }
                    socket
                }
                None => {
                    // Expired while still registered; the kernel dropped
                    // the fd from the set when it was closed.
                    slots.remove(cookie);
                    log::trace!("Socket expired: cookie {:#x}", cookie);
                    return;
                }
            }
        };

        if hangup {
            socket.core().advance_state(SocketState::Closed);

            let err = if flags.contains(EpollFlags::EPOLLERR) {
                Some(so_error(socket.core().raw_fd()))
            } else {
                None
            };

            let _ = self.epoll.delete(socket.core().fd());
            run_callback("socket closure callback", || socket.on_closed(err));
            return;
        }

        if socket.core().state() == SocketState::Closed {
            // Force closure; the hang-up arrives next round.
            unsafe {
                libc::shutdown(socket.core().raw_fd(), libc::SHUT_RDWR);
            }
            return;
        }

        if flags.contains(EpollFlags::EPOLLPRI) {
            run_callback("socket out-of-band read callback", || {
                socket.on_oob_readable()
            });
        }
        if flags.contains(EpollFlags::EPOLLIN) {
            run_callback("socket read callback", || socket.on_readable());
        }
        if flags.contains(EpollFlags::EPOLLOUT) {
            run_callback("socket write callback", || socket.on_writable());
        }

        // If too many bytes are pending, hide read readiness until the
        // peer catches up; a slow reader must not grow our memory.
        let throttled = socket.core().write_queue_size() > throttle_size;
        if throttled != socket.core().throttled() {
            socket.core().set_throttled(throttled);
            let mut event = EpollEvent::new(interest_flags(throttled), cookie);
            if let Err(errno) = self.epoll.modify(socket.core().fd(), &mut event) {
                log::error!(
                    "Could not modify epoll flags for socket fd {}: {}",
                    socket.core().raw_fd(),
                    errno
                );
            }
        }
    }
}

fn so_error(fd: std::os::fd::RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{ListenSocket, SocketAddress};

    #[test]
    fn test_insert_and_expire() -> Result<()> {
        let driver = Arc::new(NetworkDriver::new()?);
        let addr: SocketAddress = "[::1]:0".parse().unwrap();
        let listener = ListenSocket::bind(&addr, |_, _| None)?;

        driver.insert(listener.clone())?;
        assert_eq!(driver.size(), 1);

        // Double registration is rejected and does not leak a slot.
        assert!(driver.insert(listener.clone()).is_err());
        assert_eq!(driver.size(), 1);

        Ok(())
    }
}
