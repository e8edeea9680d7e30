use libc::{
    AF_INET, AF_INET6, c_int, sa_family_t, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t,
};

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

/// Encodes `address` as a raw socket address suitable for `connect(2)` and `bind(2)`.
pub(crate) fn socketaddr_to_raw(address: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    let length = match address {
        SocketAddr::V4(v4) => {
            let mut raw: sockaddr_in = unsafe { mem::zeroed() };
            raw.sin_family = AF_INET as sa_family_t;
            raw.sin_port = v4.port().to_be();
            raw.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                raw.sin_len = mem::size_of::<sockaddr_in>() as u8;
            }

            unsafe { ptr::write(&mut storage as *mut sockaddr_storage as *mut sockaddr_in, raw) };
            mem::size_of::<sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let mut raw: sockaddr_in6 = unsafe { mem::zeroed() };
            raw.sin6_family = AF_INET6 as sa_family_t;
            raw.sin6_port = v6.port().to_be();
            raw.sin6_addr.s6_addr = v6.ip().octets();
            raw.sin6_flowinfo = v6.flowinfo();
            raw.sin6_scope_id = v6.scope_id();
            #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
            {
                raw.sin6_len = mem::size_of::<sockaddr_in6>() as u8;
            }

            unsafe { ptr::write(&mut storage as *mut sockaddr_storage as *mut sockaddr_in6, raw) };
            mem::size_of::<sockaddr_in6>()
        }
    };

    (storage, length as socklen_t)
}

/// Decodes a raw socket address filled in by the kernel.
pub(crate) fn raw_to_socketaddr(
    storage: &sockaddr_storage,
    length: socklen_t,
) -> io::Result<SocketAddr> {
    let length = length as usize;

    match storage.ss_family as c_int {
        AF_INET if length >= mem::size_of::<sockaddr_in>() => {
            let raw = unsafe { &*(storage as *const sockaddr_storage as *const sockaddr_in) };
            let ip = Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());

            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(raw.sin_port))))
        }
        AF_INET6 if length >= mem::size_of::<sockaddr_in6>() => {
            let raw = unsafe { &*(storage as *const sockaddr_storage as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(raw.sin6_addr.s6_addr);

            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(raw.sin6_port),
                raw.sin6_flowinfo,
                raw.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {family} (length {length})"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::{raw_to_socketaddr, socketaddr_to_raw};
    use std::net::SocketAddr;

    #[test]
    fn encodes_both_families() {
        for text in ["127.0.0.1:8080", "[::1]:4242", "10.1.2.3:0"] {
            let address: SocketAddr = text.parse().unwrap();
            let (storage, length) = socketaddr_to_raw(&address);
            assert_eq!(raw_to_socketaddr(&storage, length).unwrap(), address);
        }
    }

    #[test]
    fn rejects_truncated_address() {
        let address: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let (storage, _) = socketaddr_to_raw(&address);
        assert!(raw_to_socketaddr(&storage, 2).is_err());
    }
}
