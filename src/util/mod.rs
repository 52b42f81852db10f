use local_ip_address::list_afinet_netifas;
use std::net::IpAddr;
use systemstat::{Platform, System};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_log() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. When `systemstat` cannot list
/// interfaces, falls back to `local-ip-address`.
///
/// ## Returns
///
/// * `Some(IpAddr)`: The first routable network interface.
/// * `None`: The host exposes no usable IPv4 address.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();

    if let Ok(networks) = system.networks() {
        for net in networks.values() {
            for n in &net.addrs {
                if let systemstat::IpAddr::V4(v) = n.addr {
                    if usable_v4(v) {
                        return Some(IpAddr::V4(v));
                    }
                }
            }
        }
    }

    let interfaces = list_afinet_netifas().ok()?;
    for (name, ip) in interfaces {
        if let IpAddr::V4(v) = ip {
            if usable_v4(v) {
                info!("Using interface {} ({})", name, ip);
                return Some(ip);
            }
        }
    }

    None
}

fn usable_v4(v: std::net::Ipv4Addr) -> bool {
    !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() && !v.is_unspecified()
}
