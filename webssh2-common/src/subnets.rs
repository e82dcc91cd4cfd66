//! Source-address allow-list matching: exact addresses, CIDR ranges and
//! `10.*.*.*`-style wildcards.

use std::net::IpAddr;

use ipnet::IpNet;

/// An empty allow-list means "no restriction".
pub fn is_ip_in_subnets(ip: IpAddr, subnets: &[String]) -> bool {
    if subnets.is_empty() {
        return true;
    }
    subnets.iter().any(|rule| matches_rule(ip, rule))
}

fn matches_rule(ip: IpAddr, rule: &str) -> bool {
    let rule = rule.trim();
    if let Ok(exact) = rule.parse::<IpAddr>() {
        return ip == exact;
    }
    if let Ok(net) = rule.parse::<IpNet>() {
        return net.contains(&ip);
    }
    if rule.contains('*') {
        return matches_wildcard(ip, rule);
    }
    false
}

fn matches_wildcard(ip: IpAddr, pattern: &str) -> bool {
    let IpAddr::V4(v4) = ip else {
        return false;
    };
    let octets = v4.octets();
    let parts: Vec<&str> = pattern.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().zip(octets.iter()).all(|(part, octet)| {
        *part == "*" || part.parse::<u8>().map(|p| p == *octet).unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_list_allows_all() {
        assert!(is_ip_in_subnets(ip("203.0.113.9"), &[]));
        assert!(is_ip_in_subnets(ip("::1"), &[]));
    }

    #[test]
    fn test_exact_match() {
        let rules = vec!["192.168.1.5".to_string()];
        assert!(is_ip_in_subnets(ip("192.168.1.5"), &rules));
        assert!(!is_ip_in_subnets(ip("192.168.1.6"), &rules));
    }

    #[test]
    fn test_cidr_v4() {
        let rules = vec!["10.0.0.0/8".to_string()];
        assert!(is_ip_in_subnets(ip("10.200.3.4"), &rules));
        assert!(!is_ip_in_subnets(ip("11.0.0.1"), &rules));
    }

    #[test]
    fn test_cidr_v6() {
        let rules = vec!["fd00::/8".to_string()];
        assert!(is_ip_in_subnets(ip("fd00::1"), &rules));
        assert!(!is_ip_in_subnets(ip("2001:db8::1"), &rules));
    }

    #[test]
    fn test_wildcard() {
        let rules = vec!["10.*.*.*".to_string()];
        assert!(is_ip_in_subnets(ip("10.1.2.3"), &rules));
        assert!(!is_ip_in_subnets(ip("172.16.0.1"), &rules));
        assert!(!is_ip_in_subnets(ip("fd00::1"), &rules));
    }

    #[test]
    fn test_any_rule_suffices() {
        let rules = vec!["172.16.0.0/12".to_string(), "10.*.*.*".to_string()];
        assert!(is_ip_in_subnets(ip("10.9.9.9"), &rules));
        assert!(is_ip_in_subnets(ip("172.20.1.1"), &rules));
        assert!(!is_ip_in_subnets(ip("8.8.8.8"), &rules));
    }
}
