use super::core::SocketCore;
use super::{AbstractSocket, SocketAddress};
use crate::socket::SocketState;
use crate::utils::callback::run_callback;
use anyhow::{anyhow, Result};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;

type AcceptFactory =
    dyn Fn(OwnedFd, SocketAddress) -> Option<Arc<dyn AbstractSocket>> + Send + Sync;

/// A TCP accept socket.
///
/// Each accepted descriptor is handed to the factory, which wraps it in
/// a concrete socket; the new socket is registered with the same driver
/// this listener belongs to. Returning `None` from the factory rejects
/// the connection.
pub struct ListenSocket {
    core: SocketCore,
    factory: Box<AcceptFactory>,
}

impl ListenSocket {
    pub fn bind<F>(addr: &SocketAddress, factory: F) -> Result<Arc<Self>>
    where
        F: Fn(OwnedFd, SocketAddress) -> Option<Arc<dyn AbstractSocket>> + Send + Sync + 'static,
    {
        let core = SocketCore::new_socket(libc::SOCK_STREAM, libc::IPPROTO_TCP)?;

        // Allow quick restarts; errors are ignored.
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                core.raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let sa = addr.to_sockaddr_in6();
        let rc = unsafe {
            libc::bind(
                core.raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(anyhow!(
                "failed to bind listening socket onto `{}`: {}",
                addr,
                std::io::Error::last_os_error()
            ));
        }

        if unsafe { libc::listen(core.raw_fd(), libc::SOMAXCONN) } != 0 {
            return Err(anyhow!(
                "failed to listen on `{}`: {}",
                addr,
                std::io::Error::last_os_error()
            ));
        }

        core.advance_state(SocketState::Established);
        log::info!("Server started listening on `{}`", core.local_address());

        Ok(Arc::new(Self {
            core,
            factory: Box::new(factory),
        }))
    }

    pub fn local_address(&self) -> SocketAddress {
        self.core.local_address()
    }
}

impl AbstractSocket for ListenSocket {
    fn core(&self) -> &SocketCore {
        &self.core
    }

    fn on_oob_readable(&self) {}

    fn on_readable(&self) {
        loop {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            let mut salen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            let rc = unsafe {
                libc::accept4(
                    self.core.raw_fd(),
                    &mut sa as *mut _ as *mut libc::sockaddr,
                    &mut salen,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        // Transient resource errors (EMFILE and friends)
                        // must not spin the network thread.
                        log::error!(
                            "Error accepting connection on `{}`: {}",
                            self.local_address(),
                            err
                        );
                        break;
                    }
                }
            }

            let fd = unsafe { OwnedFd::from_raw_fd(rc) };
            let peer = if sa.sin6_family == libc::AF_INET6 as libc::sa_family_t {
                SocketAddress::from_sockaddr_in6(&sa)
            } else {
                super::addr::IPV6_INVALID
            };

            let mut produced = None;
            if !run_callback("accept factory", || {
                produced = (self.factory)(fd, peer);
            }) {
                continue;
            }

            let socket = match produced {
                Some(socket) => socket,
                None => continue,
            };

            match self.core.driver().and_then(|(weak, _)| weak.upgrade()) {
                Some(driver) => {
                    if let Err(err) = driver.insert(socket) {
                        log::error!("Could not register accepted connection: {:#}", err);
                        continue;
                    }
                    log::info!(
                        "Accepted connection from `{}` on `{}`",
                        peer,
                        self.local_address()
                    );
                }
                None => {
                    log::error!("Listening socket is not registered with a driver");
                    return;
                }
            }
        }
    }

    fn on_writable(&self) {}

    fn on_closed(&self, err: Option<i32>) {
        if self.core.take_closed_callback() {
            log::info!(
                "Server on `{}` stopped listening: {}",
                self.local_address(),
                super::stream::describe_errno(err)
            );
        }
    }
}
