//! Packet-forwarding records for the containers assigned to this worker.
//!
//! The scheduler derives one record per container with a network endpoint:
//! the veth and patch-port names, a MAC derived from the container's IP, and
//! the sets of ports for which public→container and container→public
//! traffic is allowed. The OVS programming that consumes these records is a
//! collaborator behind [`Forwarder`].

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use tracing::debug;

use drover_client::{Counters, PUBLIC};
use drover_db::{Connection, Container};

const MODULE: &str = "network";

/// Counter bumped for every public connection whose port range cannot be
/// expressed as a single forwarding rule.
pub const UNSUPPORTED_RANGE_COUNTER: &str = "Unsupported Public Port Range";

/// One container's worth of forwarding state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Forwarding {
    pub veth: String,
    pub patch_peer: String,
    pub mac: String,
    pub ip: String,
    /// Ports open from the public Internet to this container.
    pub from_public: BTreeSet<u16>,
    /// Ports this container may use to reach the public Internet.
    pub to_public: BTreeSet<u16>,
}

/// Applies a complete forwarding rule set. Replacement is atomic: the old
/// set is fully superseded by the new one.
pub trait Forwarder: Send + Sync {
    fn replace(&self, rules: Vec<Forwarding>);
}

/// Forwarder for builds without OVS plumbing linked in.
pub struct LoggingForwarder;

impl Forwarder for LoggingForwarder {
    fn replace(&self, rules: Vec<Forwarding>) {
        debug!(rules = rules.len(), "replacing forwarding rules");
    }
}

/// Derive the forwarding record set for the given containers. Connections
/// involving `public` contribute the port sets; ranges wider than a single
/// port are skipped and counted.
pub fn forwarding_rules(
    counters: &Counters,
    containers: &[Container],
    connections: &[Connection],
) -> Vec<Forwarding> {
    let mut from_public: BTreeMap<&str, BTreeSet<u16>> = BTreeMap::new();
    let mut to_public: BTreeMap<&str, BTreeSet<u16>> = BTreeMap::new();
    for conn in connections {
        if conn.from != PUBLIC && conn.to != PUBLIC {
            continue;
        }
        if conn.min_port != conn.max_port {
            counters.inc(MODULE, UNSUPPORTED_RANGE_COUNTER);
            continue;
        }
        if conn.from == PUBLIC {
            from_public
                .entry(conn.to.as_str())
                .or_default()
                .insert(conn.min_port);
        } else {
            to_public
                .entry(conn.from.as_str())
                .or_default()
                .insert(conn.min_port);
        }
    }

    containers
        .iter()
        .filter(|c| !c.endpoint_id.is_empty())
        .map(|c| {
            let short = &c.endpoint_id[..c.endpoint_id.len().min(7)];
            Forwarding {
                veth: format!("veth{short}"),
                patch_peer: format!("patch{short}"),
                mac: mac_from_ip(&c.ip),
                ip: c.ip.clone(),
                from_public: from_public
                    .get(c.hostname.as_str())
                    .cloned()
                    .unwrap_or_default(),
                to_public: to_public
                    .get(c.hostname.as_str())
                    .cloned()
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// A locally administered MAC derived from the container's IPv4 address.
pub fn mac_from_ip(ip: &str) -> String {
    match ip.parse::<Ipv4Addr>() {
        Ok(addr) => {
            let octets = addr.octets();
            format!(
                "02:00:{:02x}:{:02x}:{:02x}:{:02x}",
                octets[0], octets[1], octets[2], octets[3]
            )
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn container(hostname: &str, ip: &str, endpoint: &str) -> Container {
        Container {
            hostname: hostname.into(),
            ip: ip.into(),
            endpoint_id: endpoint.into(),
            ..Default::default()
        }
    }

    fn connection(from: &str, to: &str, min: u16, max: u16) -> Connection {
        Connection {
            from: from.into(),
            to: to.into(),
            min_port: min,
            max_port: max,
            ..Default::default()
        }
    }

    #[test]
    fn mac_is_derived_from_ip() {
        assert_eq!(mac_from_ip("10.0.0.2"), "02:00:0a:00:00:02");
        assert_eq!(mac_from_ip("not-an-ip"), "");
    }

    #[test]
    fn public_connections_open_ports() {
        let counters = Counters::new();
        let containers = vec![container("web", "10.0.0.2", "endpoint-1234567890")];
        let connections = vec![
            connection("public", "web", 80, 80),
            connection("web", "public", 443, 443),
        ];
        let rules = forwarding_rules(&counters, &containers, &connections);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].veth, "vethendpoin");
        assert!(rules[0].from_public.contains(&80));
        assert!(rules[0].to_public.contains(&443));
    }

    #[test]
    fn containers_without_endpoints_are_skipped() {
        let counters = Counters::new();
        let containers = vec![container("web", "10.0.0.2", "")];
        let rules = forwarding_rules(&counters, &containers, &[]);
        assert!(rules.is_empty());
    }

    #[test]
    fn public_port_ranges_are_skipped_and_counted() {
        let counters = Counters::new();
        let containers = vec![container("svc", "10.0.0.3", "endpoint-abc")];
        let connections = vec![connection("public", "svc", 80, 81)];
        let rules = forwarding_rules(&counters, &containers, &connections);
        assert!(rules[0].from_public.is_empty());
        assert_eq!(counters.get(MODULE, UNSUPPORTED_RANGE_COUNTER), 1);
    }

    #[test]
    fn private_ranges_are_fine() {
        let counters = Counters::new();
        let connections = vec![connection("web", "db", 1024, 2048)];
        forwarding_rules(&counters, &[], &connections);
        assert_eq!(counters.get(MODULE, UNSUPPORTED_RANGE_COUNTER), 0);
    }
}
