//! Recovers the connection's pre-NAT destination from an iptables
//! `REDIRECT` via `SO_ORIGINAL_DST`, trying the IPv4 sockopt first and
//! falling back to the IPv6 one.

use std::ffi::c_void;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::fd::RawFd;

use tokio::net::TcpStream;

use crate::error::ProxyError;

const SO_ORIGINAL_DST: libc::c_int = 80;

pub fn recover_original_dst(stream: &TcpStream) -> Result<SocketAddr, ProxyError> {
    let fd = stream.as_raw_fd();
    recover_v4(fd).or_else(|_| recover_v6(fd)).map_err(ProxyError::OriginalDst)
}

fn recover_v4(fd: RawFd) -> std::io::Result<SocketAddr> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            &mut addr as *mut libc::sockaddr_in as *mut c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Ok(SocketAddr::new(IpAddr::V4(ip), port))
}

fn recover_v6(fd: RawFd) -> std::io::Result<SocketAddr> {
    let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IPV6,
            SO_ORIGINAL_DST,
            &mut addr as *mut libc::sockaddr_in6 as *mut c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
    let port = u16::from_be(addr.sin6_port);
    Ok(SocketAddr::new(IpAddr::V6(ip), port))
}

/// Sets `SO_MARK` on the outbound upstream socket so the kernel's iptables
/// rules can recognize traffic the proxy itself originates and exempt it
/// from the `REDIRECT` rule that would otherwise loop it back here.
pub const EGRESS_MARK: u32 = 0x2000;

pub fn set_egress_mark(stream: &TcpStream) -> std::io::Result<()> {
    let fd = stream.as_raw_fd();
    let mark = EGRESS_MARK;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &mark as *const u32 as *const c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
