//! Shared helpers for the end-to-end tests.

use std::sync::Once;

use girder_net::{Family, Host, TcpAddrInfo, listen_on};

static INIT_LOGGING: Once = Once::new();

/// Install a compact tracing subscriber once per test binary.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_max_level(tracing::Level::WARN)
            .try_init();
    });
}

/// A loopback address on a port the OS just confirmed free.
///
/// The probe listener is dropped before returning, so a racing process could
/// in principle steal the port; good enough for tests.
pub fn free_loopback_addr() -> TcpAddrInfo {
    let any = TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, 0).unwrap();
    let probe = listen_on(&any, 1).unwrap();
    let port = probe.local_endpoint().unwrap().port();
    drop(probe);
    TcpAddrInfo::with_port(Family::Ipv4, Host::Loopback, port).unwrap()
}
