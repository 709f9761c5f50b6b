//! TCP endpoint resolution.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{NetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

/// The host part of an endpoint specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    /// Bind-to-any sentinel (`0.0.0.0` / `::`).
    Wildcard,
    /// Loopback sentinel (`127.0.0.1` / `::1`).
    Loopback,
    /// A host name or address literal.
    Name(String),
}

impl Host {
    fn literal(&self, family: Family) -> &str {
        match (self, family) {
            (Host::Wildcard, Family::Ipv4) => "0.0.0.0",
            (Host::Wildcard, Family::Ipv6) => "::",
            (Host::Loopback, Family::Ipv4) => "127.0.0.1",
            (Host::Loopback, Family::Ipv6) => "::1",
            (Host::Name(name), _) => name,
        }
    }
}

/// A resolved TCP address: family, host, service and the endpoint list.
///
/// Resolution happens at construction; a `TcpAddrInfo` that exists always
/// carries at least one endpoint of its family.
#[derive(Debug, Clone)]
pub struct TcpAddrInfo {
    family: Family,
    host: Host,
    service: String,
    endpoints: Vec<SocketAddr>,
    canonical_name: String,
}

impl TcpAddrInfo {
    /// Resolve `host`:`service` for `family`. `service` may be a port number
    /// or a service name known to the resolver.
    pub fn new(family: Family, host: Host, service: &str) -> Result<Self> {
        let literal = host.literal(family).to_string();
        let port = resolve_service(service)?;
        let target = match family {
            Family::Ipv4 => format!("{literal}:{port}"),
            Family::Ipv6 => format!("[{literal}]:{port}"),
        };
        let resolved = target
            .to_socket_addrs()
            .map_err(|e| NetError::Resolution(target.clone(), e))?;
        let endpoints: Vec<SocketAddr> = resolved
            .filter(|addr| match family {
                Family::Ipv4 => addr.is_ipv4(),
                Family::Ipv6 => addr.is_ipv6(),
            })
            .collect();
        if endpoints.is_empty() {
            return Err(NetError::NoEndpoints(target));
        }
        Ok(TcpAddrInfo {
            family,
            host,
            service: service.to_string(),
            endpoints,
            canonical_name: literal,
        })
    }

    /// Shorthand for a numeric port.
    pub fn with_port(family: Family, host: Host, port: u16) -> Result<Self> {
        TcpAddrInfo::new(family, host, &port.to_string())
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Never empty.
    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    pub fn first_endpoint(&self) -> SocketAddr {
        self.endpoints[0]
    }

    pub fn canonical_name(&self) -> &str {
        &self.canonical_name
    }
}

impl fmt::Display for TcpAddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.canonical_name, self.service)
    }
}

/// Turn a service specification into a port: numeric first, then the
/// services database.
fn resolve_service(service: &str) -> Result<u16> {
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }
    let name = std::ffi::CString::new(service).map_err(|_| {
        NetError::Resolution(
            service.to_string(),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "service contains NUL"),
        )
    })?;
    // SAFETY: both pointers are valid NUL-terminated strings; the returned
    // servent is read before any other libc call can reuse its storage.
    let port = unsafe {
        let entry = libc::getservbyname(name.as_ptr(), c"tcp".as_ptr());
        if entry.is_null() {
            return Err(NetError::Resolution(
                service.to_string(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "unknown service name"),
            ));
        }
        u16::from_be((*entry).s_port as u16)
    };
    Ok(port)
}
