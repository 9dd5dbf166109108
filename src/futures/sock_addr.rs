use std::net::SocketAddr;

union CSockAddrs {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

/// A [SocketAddr] laid out for `connect(2)`.
pub(crate) struct CSockAddr {
    addr: CSockAddrs,
    len: libc::socklen_t,
}

impl From<SocketAddr> for CSockAddr {
    fn from(value: SocketAddr) -> Self {
        let mut addr: CSockAddrs = unsafe { std::mem::zeroed() };

        match value {
            SocketAddr::V4(v4) => {
                addr.v4.sin_family = libc::AF_INET as libc::sa_family_t;
                addr.v4.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                addr.v4.sin_port = v4.port().to_be();

                CSockAddr {
                    addr,
                    len: std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                }
            }
            SocketAddr::V6(v6) => {
                addr.v6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                addr.v6.sin6_addr.s6_addr = v6.ip().octets();
                addr.v6.sin6_port = v6.port().to_be();
                addr.v6.sin6_flowinfo = v6.flowinfo();
                addr.v6.sin6_scope_id = v6.scope_id();

                CSockAddr {
                    addr,
                    len: std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                }
            }
        }
    }
}

impl CSockAddr {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.addr as *const _ as *const _
    }

    pub fn socklen(&self) -> libc::socklen_t {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::CSockAddr;

    #[test]
    fn encodes_network_byte_order() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let c = CSockAddr::from(addr);

        assert_eq!(c.socklen() as usize, std::mem::size_of::<libc::sockaddr_in>());
        unsafe {
            assert_eq!(c.addr.v4.sin_family, libc::AF_INET as libc::sa_family_t);
            assert_eq!(c.addr.v4.sin_port, 8080u16.to_be());
            assert_eq!(c.addr.v4.sin_addr.s_addr, u32::from_be_bytes([127, 0, 0, 1]).to_be());
        }
    }
}
