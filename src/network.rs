use crate::Error;
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub ip: IpAddr,
    pub network: IpNet,
    pub present: bool,
}

impl std::fmt::Display for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.present {
            write!(f, "{} address is present in {} network", self.ip, self.network)
        } else {
            write!(
                f,
                "{} address is not present in {} network",
                self.ip, self.network
            )
        }
    }
}

/// Parse a network the way `ip_network` tools usually do: a bare address is
/// a single-host network, and host bits set after the prefix are rejected.
pub fn parse_network(input: &str) -> Result<IpNet, Error> {
    let input = input.trim();
    let cidr = if input.contains('/') {
        input.to_string()
    } else {
        let max_prefix = if parse_ip(input)?.is_ipv4() { 32 } else { 128 };
        format!("{input}/{max_prefix}")
    };
    let network = IpNet::from_str(&cidr).map_err(|source| Error::NetParseError {
        input: input.to_string(),
        source,
    })?;
    if network.trunc() != network {
        return Err(Error::HostBitsSet {
            input: input.to_string(),
        });
    }
    Ok(network)
}

pub fn parse_ip(input: &str) -> Result<IpAddr, Error> {
    IpAddr::from_str(input.trim()).map_err(|source| Error::AddrParseError {
        input: input.to_string(),
        source,
    })
}

pub fn check_membership(ip: &str, network: &str) -> Result<Membership, Error> {
    let ip = parse_ip(ip)?;
    let network = parse_network(network)?;
    Ok(Membership {
        present: network.contains(&ip),
        ip,
        network,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ip_in_network() -> anyhow::Result<()> {
        let m = check_membership("19.205.73.132", "19.128.0.0/9")?;
        assert!(m.present);
        assert_eq!(
            m.to_string(),
            "19.205.73.132 address is present in 19.128.0.0/9 network"
        );
        Ok(())
    }

    #[test]
    fn test_ip_not_in_network() -> anyhow::Result<()> {
        let m = check_membership("19.205.73.132", "19.128.0.0/10")?;
        assert!(!m.present);
        assert_eq!(
            m.to_string(),
            "19.205.73.132 address is not present in 19.128.0.0/10 network"
        );
        Ok(())
    }

    #[test]
    fn test_ipv6_and_mixed_families() {
        assert!(check_membership("2001:db8::1", "2001:db8::/32").unwrap().present);
        assert!(!check_membership("10.0.0.1", "2001:db8::/32").unwrap().present);
    }

    #[test]
    fn test_bare_address_is_host_network() {
        let m = check_membership("10.1.2.3", "10.1.2.3").unwrap();
        assert!(m.present);
        assert_eq!(m.network.prefix_len(), 32);
    }

    #[test]
    fn test_malformed_inputs() {
        assert!(matches!(
            check_membership("19.205.73", "19.128.0.0/9"),
            Err(Error::AddrParseError { .. })
        ));
        assert!(matches!(
            check_membership("19.205.73.132", "19.128.0.0/33"),
            Err(Error::NetParseError { .. })
        ));
        assert!(matches!(
            check_membership("19.205.73.132", "19.205.73.132/9"),
            Err(Error::HostBitsSet { .. })
        ));
    }
}
