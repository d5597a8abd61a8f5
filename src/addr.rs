//! Socket address families usable with [`Socket`](crate::socket::Socket).
//!
//! Every family is a fixed size, comparable value that can hand out the raw
//! `sockaddr` pointer and length the OS calls expect.

use std::{
    fmt::{Debug, Display},
    io::{Error, ErrorKind, Result},
    mem::{size_of, zeroed},
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    os::unix::ffi::OsStrExt,
    path::Path,
    str::FromStr,
};

use libc::{c_int, sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, sockaddr_un, socklen_t};
use os_socketaddr::OsSocketAddr;

/// Capability trait implemented by one type per address family.
pub trait SocketAddress:
    Copy + PartialEq + Debug + Display + Send + Sync + Sized + 'static
{
    /// Protocol family passed to `socket(2)`, e.g. `AF_INET`.
    const DOMAIN: c_int;

    /// Length of the valid part of the raw address.
    fn socklen(&self) -> socklen_t;

    /// Raw pointer handed to `bind(2)`/`connect(2)`.
    fn as_ptr(&self) -> *const sockaddr;

    /// Decode an address returned by `getsockname(2)` and friends.
    ///
    /// Returns [`None`] if the storage holds another family.
    fn from_storage(storage: &sockaddr_storage, len: socklen_t) -> Option<Self>;

    /// Raw byte view of the address.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: `as_ptr` points at `self`, which is at least `socklen` bytes long.
        unsafe { std::slice::from_raw_parts(self.as_ptr().cast::<u8>(), self.socklen() as usize) }
    }
}

fn family_of(storage: &sockaddr_storage) -> c_int {
    storage.ss_family as c_int
}

/// Copy a `T` out of the generic storage after checking the family and length.
fn read_storage<T: Copy>(storage: &sockaddr_storage, len: socklen_t, domain: c_int) -> Option<T> {
    if family_of(storage) != domain || (len as usize) < size_of::<T>() {
        return None;
    }

    // SAFETY: sockaddr_storage is large and aligned enough for every sockaddr type.
    Some(unsafe { *(storage as *const sockaddr_storage).cast::<T>() })
}

/// IPv4 address (`sockaddr_in`).
#[derive(Clone, Copy)]
pub struct Inet4Address(sockaddr_in);

impl Inet4Address {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        SocketAddrV4::new(ip, port).into()
    }

    /// Loopback address with the wildcard port, resolved by the OS on bind.
    pub fn localhost() -> Self {
        Self::new(Ipv4Addr::LOCALHOST, 0)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from_be(self.0.sin_addr.s_addr))
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.0.sin_port)
    }

    pub fn is_wildcard_port(&self) -> bool {
        self.port() == 0
    }
}

impl From<SocketAddrV4> for Inet4Address {
    fn from(value: SocketAddrV4) -> Self {
        let addr: OsSocketAddr = SocketAddr::V4(value).into();

        // SAFETY: OsSocketAddr stores a sockaddr_in for V4 addresses.
        Self(unsafe { *addr.as_ptr().cast::<sockaddr_in>() })
    }
}

impl From<Inet4Address> for SocketAddrV4 {
    fn from(value: Inet4Address) -> Self {
        SocketAddrV4::new(value.ip(), value.port())
    }
}

impl FromStr for Inet4Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(s.parse::<SocketAddrV4>()?.into())
    }
}

impl PartialEq for Inet4Address {
    fn eq(&self, other: &Self) -> bool {
        self.ip() == other.ip() && self.port() == other.port()
    }
}

impl Debug for Inet4Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Inet4Address")
            .field(&SocketAddrV4::from(*self))
            .finish()
    }
}

impl Display for Inet4Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", SocketAddrV4::from(*self))
    }
}

impl SocketAddress for Inet4Address {
    const DOMAIN: c_int = libc::AF_INET;

    fn socklen(&self) -> socklen_t {
        size_of::<sockaddr_in>() as socklen_t
    }

    fn as_ptr(&self) -> *const sockaddr {
        (&self.0 as *const sockaddr_in).cast()
    }

    fn from_storage(storage: &sockaddr_storage, len: socklen_t) -> Option<Self> {
        read_storage(storage, len, Self::DOMAIN).map(Self)
    }
}

/// IPv6 address (`sockaddr_in6`).
#[derive(Clone, Copy)]
pub struct Inet6Address(sockaddr_in6);

impl Inet6Address {
    pub fn new(ip: Ipv6Addr, port: u16) -> Self {
        SocketAddrV6::new(ip, port, 0, 0).into()
    }

    pub fn localhost() -> Self {
        Self::new(Ipv6Addr::LOCALHOST, 0)
    }

    pub fn ip(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.0.sin6_addr.s6_addr)
    }

    pub fn port(&self) -> u16 {
        u16::from_be(self.0.sin6_port)
    }

    pub fn is_wildcard_port(&self) -> bool {
        self.port() == 0
    }
}

impl From<SocketAddrV6> for Inet6Address {
    fn from(value: SocketAddrV6) -> Self {
        let addr: OsSocketAddr = SocketAddr::V6(value).into();

        // SAFETY: OsSocketAddr stores a sockaddr_in6 for V6 addresses.
        Self(unsafe { *addr.as_ptr().cast::<sockaddr_in6>() })
    }
}

impl From<Inet6Address> for SocketAddrV6 {
    fn from(value: Inet6Address) -> Self {
        SocketAddrV6::new(
            value.ip(),
            value.port(),
            value.0.sin6_flowinfo,
            value.0.sin6_scope_id,
        )
    }
}

impl FromStr for Inet6Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(s.parse::<SocketAddrV6>()?.into())
    }
}

impl PartialEq for Inet6Address {
    fn eq(&self, other: &Self) -> bool {
        SocketAddrV6::from(*self) == SocketAddrV6::from(*other)
    }
}

impl Debug for Inet6Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Inet6Address")
            .field(&SocketAddrV6::from(*self))
            .finish()
    }
}

impl Display for Inet6Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", SocketAddrV6::from(*self))
    }
}

impl SocketAddress for Inet6Address {
    const DOMAIN: c_int = libc::AF_INET6;

    fn socklen(&self) -> socklen_t {
        size_of::<sockaddr_in6>() as socklen_t
    }

    fn as_ptr(&self) -> *const sockaddr {
        (&self.0 as *const sockaddr_in6).cast()
    }

    fn from_storage(storage: &sockaddr_storage, len: socklen_t) -> Option<Self> {
        read_storage(storage, len, Self::DOMAIN).map(Self)
    }
}

/// Unix domain address (`sockaddr_un`).
///
/// Unlike the inet families the valid length varies with the path, so it is
/// carried next to the raw address.
#[derive(Clone, Copy)]
pub struct UnixAddress {
    addr: sockaddr_un,
    len: socklen_t,
}

fn sun_path_offset(addr: &sockaddr_un) -> usize {
    let base = addr as *const sockaddr_un as usize;
    let path = addr.sun_path.as_ptr() as usize;

    path - base
}

impl UnixAddress {
    /// Address for the filesystem `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = path.as_ref().as_os_str().as_bytes();

        // SAFETY: sockaddr_un is plain old data, all-zero is a valid value.
        let mut addr: sockaddr_un = unsafe { zeroed() };

        // keep room for the trailing NUL
        if bytes.len() >= addr.sun_path.len() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("unix socket path too long ({} bytes)", bytes.len()),
            ));
        }

        if bytes.contains(&0) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "unix socket path contains a NUL byte",
            ));
        }

        addr.sun_family = libc::AF_UNIX as sa_family_t;

        for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        let len = (sun_path_offset(&addr) + bytes.len() + 1) as socklen_t;

        #[cfg(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly"
        ))]
        {
            addr.sun_len = len as u8;
        }

        Ok(Self { addr, len })
    }

    /// Filesystem path, or [`None`] for an unnamed socket.
    pub fn path(&self) -> Option<&Path> {
        let offset = sun_path_offset(&self.addr);
        let len = (self.len as usize).saturating_sub(offset);

        if len == 0 {
            return None;
        }

        // SAFETY: sun_path is a c_char array; reinterpreting it as bytes is sound.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.addr.sun_path.as_ptr().cast::<u8>(), len)
        };

        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());

        Some(Path::new(std::ffi::OsStr::from_bytes(&bytes[..end])))
    }
}

impl PartialEq for UnixAddress {
    fn eq(&self, other: &Self) -> bool {
        self.path() == other.path()
    }
}

impl Debug for UnixAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UnixAddress").field(&self.path()).finish()
    }
}

impl Display for UnixAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.path() {
            Some(path) => write!(f, "{}", path.display()),
            None => write!(f, "(unnamed)"),
        }
    }
}

impl SocketAddress for UnixAddress {
    const DOMAIN: c_int = libc::AF_UNIX;

    fn socklen(&self) -> socklen_t {
        self.len
    }

    fn as_ptr(&self) -> *const sockaddr {
        (&self.addr as *const sockaddr_un).cast()
    }

    fn from_storage(storage: &sockaddr_storage, len: socklen_t) -> Option<Self> {
        if family_of(storage) != Self::DOMAIN || len as usize > size_of::<sockaddr_un>() {
            return None;
        }

        // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_un.
        let addr = unsafe { *(storage as *const sockaddr_storage).cast::<sockaddr_un>() };

        Some(Self { addr, len })
    }
}
