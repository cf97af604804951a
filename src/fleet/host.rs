//! Host discovery used for certificate SANs and reported worker addresses.

use std::ffi::CStr;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::warn;

use crate::config::settings::is_hostname;
use crate::domain::FleetTopology;

/// Name and primary address of the machine the fleet runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub hostname: Option<String>,
    pub ip: Option<IpAddr>,
}

impl HostIdentity {
    /// Look up the hostname and the address of the default-route interface.
    /// Failures are logged and leave the field empty.
    pub fn discover() -> Self {
        let hostname = match hostname() {
            Ok(name) => checked_hostname(name),
            Err(e) => {
                warn!(error = %e, "Could not determine hostname");
                None
            }
        };
        let ip = match outbound_ip() {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!(error = %e, "Could not determine host IP address");
                None
            }
        };
        Self { hostname, ip }
    }

    /// Address a worker should advertise when it listens on an unspecified address
    pub fn advertised_ip(&self) -> IpAddr {
        self.ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

/// `name` if it can be used as a DNS SAN; anything else is dropped with a warning
fn checked_hostname(name: String) -> Option<String> {
    if is_hostname(&name) {
        Some(name)
    } else {
        warn!(hostname = %name, "Hostname is not a valid DNS name; leaving it out of the certificate");
        None
    }
}

/// Every name the shared leaf certificate must cover for this run
pub fn collect_sans(host: &HostIdentity, listen_address: &str, topology: &FleetTopology) -> Vec<String> {
    let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string(), "::1".to_string()];
    if let Some(name) = &host.hostname {
        names.push(name.clone());
    }
    if let Some(ip) = host.ip {
        names.push(ip.to_string());
    }
    if !listen_address.is_empty() {
        names.push(listen_address.to_string());
    }
    names.extend(topology.iter().map(|spec| spec.name.to_string()));
    names
}

fn hostname() -> std::io::Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for its full length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let name = CStr::from_bytes_until_nul(&buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        .to_string_lossy()
        .into_owned();
    if name.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "empty hostname"));
    }
    Ok(name)
}

fn outbound_ip() -> std::io::Result<IpAddr> {
    // connect() on UDP only selects a route, nothing is sent.
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:53")?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sans_include_loopback_listen_address_and_workers() {
        let host = HostIdentity { hostname: Some("box.example".into()), ip: Some("10.0.0.7".parse().unwrap()) };
        let topology = FleetTopology::new("p", 1);
        let names = collect_sans(&host, "0.0.0.0", &topology);

        for expected in ["localhost", "127.0.0.1", "::1", "box.example", "10.0.0.7", "0.0.0.0", "p-edge-0", "p-reencrypt-0"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }

    #[test]
    fn advertised_ip_falls_back_to_loopback() {
        let host = HostIdentity { hostname: None, ip: None };
        assert_eq!(host.advertised_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn non_dns_hostnames_are_dropped() {
        assert_eq!(checked_hostname("box.example".into()).as_deref(), Some("box.example"));
        assert_eq!(checked_hostname("build-07".into()).as_deref(), Some("build-07"));
        assert_eq!(checked_hostname("héllo".into()), None);
        assert_eq!(checked_hostname("bad_host".into()), None);
        assert_eq!(checked_hostname("-lead.example".into()), None);
        assert_eq!(checked_hostname("a..b".into()), None);
    }

    #[test]
    fn discover_never_panics() {
        let host = HostIdentity::discover();
        if let Some(name) = host.hostname {
            assert!(is_hostname(&name));
        }
    }
}
