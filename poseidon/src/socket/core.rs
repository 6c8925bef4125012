use super::addr::{SocketAddress, IPV6_INVALID};
use super::tls::TlsChannel;
use crate::net::NetworkDriver;
use crate::utils::ByteQueue;
use anyhow::{anyhow, Result};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{OnceLock, Weak};

/// Connection lifecycle. Transitions only ever advance; `Established`
/// may be skipped when a socket is closed before its first writable
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SocketState {
    Pending = 0,
    Established,
    Closing,
    Closed,
}

impl SocketState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SocketState::Pending,
            1 => SocketState::Established,
            2 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

/// Per-socket queues and TLS state, guarded by the re-entrant I/O lock.
///
/// The cells are borrowed only transiently, never across a user
/// callback, so a `send` from inside a stream callback re-enters the
/// lock and borrows fresh.
pub(crate) struct IoBuffers {
    pub(crate) read: RefCell<ByteQueue>,
    pub(crate) write: RefCell<ByteQueue>,
    pub(crate) tls: RefCell<Option<TlsChannel>>,
}

/// State shared by every socket variant: the owned file descriptor, the
/// state machine, the I/O queues and the driver registration.
pub struct SocketCore {
    fd: OwnedFd,
    state: AtomicU8,
    io: ReentrantMutex<IoBuffers>,

    /// Mirrors whether the readiness set currently suppresses read
    /// notifications for this socket.
    throttled: AtomicBool,

    closed_fired: AtomicBool,

    driver: OnceLock<(Weak<NetworkDriver>, u64)>,

    local_cache: Mutex<Option<SocketAddress>>,
    peer_cache: Mutex<Option<SocketAddress>>,
}

impl SocketCore {
    /// Creates a new AF_INET6 socket of the given type, non-blocking and
    /// close-on-exec, accepting IPv4-mapped peers.
    pub(crate) fn new_socket(sock_type: libc::c_int, protocol: libc::c_int) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET6,
                sock_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol,
            )
        };
        if fd < 0 {
            return Err(anyhow!(
                "could not create socket: {}",
                std::io::Error::last_os_error()
            ));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // Dual-stack; errors are ignored.
        let off: libc::c_int = 0;
        unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &off as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        Ok(Self::from_owned_fd(fd))
    }

    /// Wraps an accepted descriptor. The accept call is expected to have
    /// requested non-blocking close-on-exec already.
    pub(crate) fn from_owned_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            state: AtomicU8::new(SocketState::Pending as u8),
            io: ReentrantMutex::new(IoBuffers {
                read: RefCell::new(ByteQueue::new()),
                write: RefCell::new(ByteQueue::new()),
                tls: RefCell::new(None),
            }),
            throttled: AtomicBool::new(false),
            closed_fired: AtomicBool::new(false),
            driver: OnceLock::new(),
            local_cache: Mutex::new(None),
            peer_cache: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn state(&self) -> SocketState {
        SocketState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advances `from → to`; returns whether this call made the change.
    /// The state machine is monotonic, so a transition to an earlier
    /// state never happens.
    pub fn set_state_if(&self, from: SocketState, to: SocketState) -> bool {
        debug_assert!(from < to);
        self.state
            .compare_exchange(
                from as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Forces the state forward to `to` (never backwards).
    pub fn advance_state(&self, to: SocketState) {
        self.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    pub(crate) fn lock_io(&self) -> ReentrantMutexGuard<'_, IoBuffers> {
        self.io.lock()
    }

    pub fn throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    pub(crate) fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::Release);
    }

    pub fn write_queue_size(&self) -> usize {
        self.lock_io().write.borrow().len()
    }

    /// Marks the closed callback as delivered; only the first caller
    /// may deliver it.
    pub(crate) fn take_closed_callback(&self) -> bool {
        !self.closed_fired.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn set_driver(&self, driver: Weak<NetworkDriver>, cookie: u64) -> Result<()> {
        self.driver
            .set((driver, cookie))
            .map_err(|_| anyhow!("socket is already registered with a driver"))
    }

    pub(crate) fn driver(&self) -> Option<(Weak<NetworkDriver>, u64)> {
        self.driver.get().cloned()
    }

    /// Shuts the socket down immediately in both directions. The driver
    /// observes the hang-up and delivers the closed callback.
    pub fn quick_shut_down(&self) {
        self.advance_state(SocketState::Closed);
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
    }

    /// The locally bound address, fetched once and cached.
    pub fn local_address(&self) -> SocketAddress {
        let mut cache = self.local_cache.lock();
        if let Some(addr) = *cache {
            return addr;
        }

        let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut salen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd.as_raw_fd(),
                &mut sa as *mut _ as *mut libc::sockaddr,
                &mut salen,
            )
        };
        if rc != 0 || sa.sin6_family != libc::AF_INET6 as libc::sa_family_t {
            return IPV6_INVALID;
        }

        let addr = SocketAddress::from_sockaddr_in6(&sa);
        *cache = Some(addr);
        addr
    }

    /// The peer address, fetched once and cached. [`IPV6_INVALID`] when
    /// the socket is not connected.
    pub fn remote_address(&self) -> SocketAddress {
        let mut cache = self.peer_cache.lock();
        if let Some(addr) = *cache {
            return addr;
        }

        let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut salen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd.as_raw_fd(),
                &mut sa as *mut _ as *mut libc::sockaddr,
                &mut salen,
            )
        };
        if rc != 0 || sa.sin6_family != libc::AF_INET6 as libc::sa_family_t {
            return IPV6_INVALID;
        }

        let addr = SocketAddress::from_sockaddr_in6(&sa);
        *cache = Some(addr);
        addr
    }
}

impl std::fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCore")
            .field("fd", &self.raw_fd())
            .field("state", &self.state())
            .field("throttled", &self.throttled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_monotonic() {
        let core = SocketCore::new_socket(libc::SOCK_STREAM, libc::IPPROTO_TCP).unwrap();
        assert_eq!(core.state(), SocketState::Pending);

        assert!(core.set_state_if(SocketState::Pending, SocketState::Established));
        assert!(!core.set_state_if(SocketState::Pending, SocketState::Established));

        core.advance_state(SocketState::Closed);
        assert_eq!(core.state(), SocketState::Closed);

        // fetch_max never regresses.
        core.advance_state(SocketState::Closing);
        assert_eq!(core.state(), SocketState::Closed);
    }

    #[test]
    fn test_closed_callback_taken_once() {
        let core = SocketCore::new_socket(libc::SOCK_DGRAM, libc::IPPROTO_UDP).unwrap();
        assert!(core.take_closed_callback());
        assert!(!core.take_closed_callback());
    }

    #[test]
    fn test_unconnected_peer_address_is_invalid_sentinel() {
        let core = SocketCore::new_socket(libc::SOCK_STREAM, libc::IPPROTO_TCP).unwrap();
        assert_eq!(core.remote_address(), IPV6_INVALID);
    }

    #[test]
    fn test_reentrant_io_lock() {
        let core = SocketCore::new_socket(libc::SOCK_STREAM, libc::IPPROTO_TCP).unwrap();
        let outer = core.lock_io();
        outer.write.borrow_mut().put(b"abc");
        {
            // A send inside a readable callback takes the same lock.
            let inner = core.lock_io();
            inner.write.borrow_mut().put(b"def");
        }
        assert_eq!(outer.write.borrow().as_slice(), b"abcdef");
    }
}
