//! Address range expansion.
//!
//! Accepts three forms:
//! - single address: `10.0.0.5`
//! - inclusive dashed range: `10.0.0.1-10.0.0.20`
//! - CIDR block: `192.168.1.0/24`
//!
//! Endpoints are converted to `u32`, iterated inclusively, and converted back,
//! so output is always ascending.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::model::validate_ipv4;

/// Rejected address expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address input '{input}': {reason}")]
pub struct InvalidInputError {
    /// Original expression.
    pub input: String,
    /// What was wrong with it.
    pub reason: String,
}

impl InvalidInputError {
    fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Inclusive `u32` bounds of an address expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: u32,
    end: u32,
}

impl AddressRange {
    /// Parse an address expression without expanding it.
    pub fn parse(input: &str) -> Result<Self, InvalidInputError> {
        let expr = input.trim();

        if let Some((base, prefix)) = expr.split_once('/') {
            let base = parse_addr(input, base)?;
            let prefix = prefix.trim();
            let prefix: u8 = prefix.parse().map_err(|_| {
                InvalidInputError::new(input, format!("prefix length '{prefix}' is not a number"))
            })?;
            let net = Ipv4Net::new(base, prefix).map_err(|_| {
                InvalidInputError::new(input, format!("prefix length {prefix} is out of range 0-32"))
            })?;
            return Ok(Self {
                start: u32::from(net.network()),
                end: u32::from(net.broadcast()),
            });
        }

        if let Some((first, last)) = expr.split_once('-') {
            let start = u32::from(parse_addr(input, first)?);
            let end = u32::from(parse_addr(input, last)?);
            if start > end {
                return Err(InvalidInputError::new(
                    input,
                    "range start is greater than range end",
                ));
            }
            return Ok(Self { start, end });
        }

        let single = u32::from(parse_addr(input, expr)?);
        Ok(Self {
            start: single,
            end: single,
        })
    }

    /// Number of addresses covered (at most 2^32).
    pub fn len(&self) -> u64 {
        u64::from(self.end) - u64::from(self.start) + 1
    }

    /// Always false: a parsed range covers at least one address.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate covered addresses in ascending order.
    pub fn addresses(self) -> impl Iterator<Item = Ipv4Addr> {
        (self.start..=self.end).map(Ipv4Addr::from)
    }
}

fn parse_addr(input: &str, part: &str) -> Result<Ipv4Addr, InvalidInputError> {
    validate_ipv4(part).map_err(|e| InvalidInputError::new(input, e.to_string()))
}

/// Expand an address expression into dotted-quad strings.
///
/// No size cap is applied; see [`resolve_bounded`].
pub fn resolve(input: &str) -> Result<Vec<String>, InvalidInputError> {
    let range = AddressRange::parse(input)?;
    Ok(range.addresses().map(|ip| ip.to_string()).collect())
}

/// Parse an address expression and check its size against `max_hosts`.
pub fn parse_bounded(input: &str, max_hosts: u64) -> Result<AddressRange, InvalidInputError> {
    let range = AddressRange::parse(input)?;
    if range.len() > max_hosts {
        return Err(InvalidInputError::new(
            input,
            format!(
                "expands to {} addresses, limit is {}",
                range.len(),
                max_hosts
            ),
        ));
    }
    Ok(range)
}

/// Expand an address expression, refusing expansions larger than `max_hosts`.
///
/// The size check happens before any allocation.
pub fn resolve_bounded(input: &str, max_hosts: u64) -> Result<Vec<String>, InvalidInputError> {
    let range = parse_bounded(input, max_hosts)?;
    Ok(range.addresses().map(|ip| ip.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_address() {
        assert_eq!(resolve("10.0.0.5").unwrap(), vec!["10.0.0.5"]);
        assert_eq!(resolve("  10.0.0.5 ").unwrap(), vec!["10.0.0.5"]);
    }

    #[test]
    fn test_dashed_range() {
        assert_eq!(
            resolve("10.0.0.1-10.0.0.3").unwrap(),
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
        assert_eq!(resolve("10.0.0.7 - 10.0.0.7").unwrap(), vec!["10.0.0.7"]);
    }

    #[test]
    fn test_dashed_range_crosses_octet_boundary() {
        let hosts = resolve("10.0.0.254-10.0.1.1").unwrap();
        assert_eq!(hosts, vec!["10.0.0.254", "10.0.0.255", "10.0.1.0", "10.0.1.1"]);
    }

    #[test]
    fn test_dashed_range_count_matches_bounds() {
        for (a, b) in [(1u32, 1u32), (1, 2), (10, 250), (0, 1023)] {
            let start = Ipv4Addr::from(0x0a00_0000 + a);
            let end = Ipv4Addr::from(0x0a00_0000 + b);
            let hosts = resolve(&format!("{start}-{end}")).unwrap();
            assert_eq!(hosts.len() as u32, b - a + 1);
            assert_eq!(hosts.first().unwrap(), &start.to_string());
            assert_eq!(hosts.last().unwrap(), &end.to_string());
        }
    }

    #[test]
    fn test_reversed_range_rejected() {
        let err = resolve("10.0.0.3-10.0.0.1").unwrap_err();
        assert!(err.reason.contains("greater"));
    }

    #[test]
    fn test_cidr_block() {
        assert_eq!(
            resolve("192.168.1.0/30").unwrap(),
            vec!["192.168.1.0", "192.168.1.1", "192.168.1.2", "192.168.1.3"]
        );
        assert_eq!(resolve("192.168.1.0/24").unwrap().len(), 256);
        assert_eq!(resolve("192.168.1.9/32").unwrap(), vec!["192.168.1.9"]);
    }

    #[test]
    fn test_cidr_masks_host_bits() {
        assert_eq!(
            resolve("192.168.1.77/30").unwrap(),
            vec!["192.168.1.76", "192.168.1.77", "192.168.1.78", "192.168.1.79"]
        );
    }

    #[test]
    fn test_cidr_sizes() {
        for n in [16u8, 20, 24, 28, 31, 32] {
            let range = AddressRange::parse(&format!("10.1.0.0/{n}")).unwrap();
            assert_eq!(range.len(), 1u64 << (32 - n));
        }
        assert_eq!(AddressRange::parse("0.0.0.0/0").unwrap().len(), 1u64 << 32);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(resolve("10.0.0").is_err());
        assert!(resolve("10.0.0.300").is_err());
        assert!(resolve("10.0.0.1-").is_err());
        assert!(resolve("10.0.0.0/33").is_err());
        assert!(resolve("10.0.0.0/abc").is_err());
        assert!(resolve("10.0.0.0/-1").is_err());
        assert!(resolve("router.local").is_err());
        assert!(resolve("").is_err());
    }

    #[test]
    fn test_resolve_bounded() {
        assert_eq!(resolve_bounded("10.0.0.0/30", 4).unwrap().len(), 4);
        let err = resolve_bounded("10.0.0.0/16", 1024).unwrap_err();
        assert!(err.reason.contains("65536"));
        assert_eq!(parse_bounded("10.0.0.0/8", u64::MAX).unwrap().len(), 1 << 24);
        assert!(parse_bounded("10.0.0.0/8", 1 << 16).is_err());
    }
}
