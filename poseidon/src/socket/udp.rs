use super::core::SocketCore;
use super::{AbstractSocket, SocketAddress, SocketState};
use crate::utils::callback::run_callback;
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// Datagram callbacks. There is no connection state; each readable
/// round delivers whole packets with their sender addresses.
pub trait UdpSession: Send + Sync + Sized + 'static {
    /// The port is open and the socket is registered with the driver.
    fn on_opened(&self, sock: &UdpSocket<Self>) {
        log::info!("UDP socket on `{}` opened", sock.local_address());
    }

    fn on_packet(&self, sock: &UdpSocket<Self>, peer: SocketAddress, data: &[u8]);

    fn on_closed(&self, sock: &UdpSocket<Self>, err: Option<i32>) {
        log::info!(
            "UDP socket on `{}` closed: {}",
            sock.local_address(),
            super::stream::describe_errno(err)
        );
    }
}

/// A connectionless UDP socket.
pub struct UdpSocket<S: UdpSession> {
    core: SocketCore,
    session: S,
}

impl<S: UdpSession> UdpSocket<S> {
    /// Creates a socket bound to `addr`, for servers.
    pub fn bind(addr: &SocketAddress, session: S) -> Result<Arc<Self>> {
        let sock = Self::unbound(session)?;

        // Allow quick restarts; errors are ignored.
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                sock.core.raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let sa = addr.to_sockaddr_in6();
        let rc = unsafe {
            libc::bind(
                sock.core.raw_fd(),
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(anyhow!(
                "failed to bind UDP socket onto `{}`: {}",
                addr,
                std::io::Error::last_os_error()
            ));
        }

        log::info!("UDP server listening on `{}`", sock.local_address());
        Ok(sock)
    }

    /// Creates an unbound socket; the kernel picks an ephemeral port on
    /// first send.
    pub fn unbound(session: S) -> Result<Arc<Self>> {
        let core = SocketCore::new_socket(libc::SOCK_DGRAM, libc::IPPROTO_UDP)?;
        Ok(Arc::new(Self { core, session }))
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn local_address(&self) -> SocketAddress {
        self.core.local_address()
    }

    /// Sends one datagram; best-effort, never buffers.
    pub fn send_to(&self, peer: &SocketAddress, data: &[u8]) -> bool {
        let sa = peer.to_sockaddr_in6();
        let rc = unsafe {
            libc::sendto(
                self.core.raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        rc >= 0
    }

    /// Joins a multicast group.
    ///
    /// Without an interface name, interface 2 is used; the first one is
    /// typically the loopback interface.
    pub fn join_multicast_group(
        &self,
        maddr: &SocketAddress,
        ttl: u8,
        loopback: bool,
        ifname_opt: Option<&str>,
    ) -> Result<()> {
        self.multicast_ctl(maddr, ttl, loopback, ifname_opt, true)
    }

    pub fn leave_multicast_group(
        &self,
        maddr: &SocketAddress,
        ifname_opt: Option<&str>,
    ) -> Result<()> {
        self.multicast_ctl(maddr, 0, false, ifname_opt, false)
    }

    fn multicast_ctl(
        &self,
        maddr: &SocketAddress,
        ttl: u8,
        loopback: bool,
        ifname_opt: Option<&str>,
        join: bool,
    ) -> Result<()> {
        let ifindex = match ifname_opt {
            Some(ifname) => {
                let c_name = std::ffi::CString::new(ifname)
                    .map_err(|_| anyhow!("invalid interface name `{}`", ifname))?;
                let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
                if idx == 0 {
                    return Err(anyhow!(
                        "failed to get index of interface `{}`: {}",
                        ifname,
                        std::io::Error::last_os_error()
                    ));
                }
                idx
            }
            None => 2,
        };

        let fd = self.core.raw_fd();
        let octets = maddr.addr();

        // IPv6 sockets do not take IPv4-mapped multicast addresses, so
        // the two families need separate treatment.
        if octets[..12] == [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF] {
            let mut mreq: libc::ip_mreqn = unsafe { std::mem::zeroed() };
            mreq.imr_multiaddr.s_addr = u32::from_ne_bytes([
                octets[12], octets[13], octets[14], octets[15],
            ]);
            mreq.imr_address.s_addr = libc::INADDR_ANY.to_be();
            mreq.imr_ifindex = ifindex as libc::c_int;

            let op = if join {
                libc::IP_ADD_MEMBERSHIP
            } else {
                libc::IP_DROP_MEMBERSHIP
            };
            setsockopt_raw(fd, libc::IPPROTO_IP, op, &mreq)
                .map_err(|e| anyhow!("failed to update IPv4 multicast group `{}`: {}", maddr, e))?;

            if join {
                let value = ttl as libc::c_int;
                setsockopt_raw(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, &value)
                    .map_err(|e| anyhow!("failed to set multicast TTL: {}", e))?;

                let value = loopback as libc::c_int;
                setsockopt_raw(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, &value)
                    .map_err(|e| anyhow!("failed to set multicast loopback: {}", e))?;
            }
        } else {
            let mut mreq: libc::ipv6_mreq = unsafe { std::mem::zeroed() };
            mreq.ipv6mr_multiaddr.s6_addr = *octets;
            mreq.ipv6mr_interface = ifindex;

            let op = if join {
                libc::IPV6_ADD_MEMBERSHIP
            } else {
                libc::IPV6_DROP_MEMBERSHIP
            };
            setsockopt_raw(fd, libc::IPPROTO_IPV6, op, &mreq)
                .map_err(|e| anyhow!("failed to update IPv6 multicast group `{}`: {}", maddr, e))?;

            if join {
                let value = ttl as libc::c_int;
                setsockopt_raw(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_HOPS, &value)
                    .map_err(|e| anyhow!("failed to set multicast hop limit: {}", e))?;

                let value = loopback as libc::c_int;
                setsockopt_raw(fd, libc::IPPROTO_IPV6, libc::IPV6_MULTICAST_LOOP, &value)
                    .map_err(|e| anyhow!("failed to set multicast loopback: {}", e))?;
            }
        }

        Ok(())
    }
}

fn setsockopt_raw<T>(
    fd: std::os::fd::RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

impl<S: UdpSession> AbstractSocket for UdpSocket<S> {
    fn core(&self) -> &SocketCore {
        &self.core
    }

    fn on_oob_readable(&self) {}

    fn on_readable(&self) {
        let mut scratch = [0u8; 0xFFFF];
        loop {
            let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            let mut salen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            let rc = unsafe {
                libc::recvfrom(
                    self.core.raw_fd(),
                    scratch.as_mut_ptr() as *mut libc::c_void,
                    scratch.len(),
                    0,
                    &mut sa as *mut _ as *mut libc::sockaddr,
                    &mut salen,
                )
            };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => {
                        // Per-packet errors are ignored.
                        log::error!(
                            "Error reading UDP socket on `{}`: {}",
                            self.local_address(),
                            err
                        );
                        continue;
                    }
                }
            }

            if sa.sin6_family != libc::AF_INET6 as libc::sa_family_t {
                continue;
            }
            let peer = SocketAddress::from_sockaddr_in6(&sa);

            run_callback("datagram callback", || {
                self.session.on_packet(self, peer, &scratch[..rc as usize])
            });
        }
    }

    fn on_writable(&self) {
        if self
            .core
            .set_state_if(SocketState::Pending, SocketState::Established)
        {
            run_callback("port open callback", || self.session.on_opened(self));
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
