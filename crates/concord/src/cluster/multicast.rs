//! Multicast group address derivation for the group-communication backend.
//!
//! IPv4 groups are picked at random from `224.0.2.0-224.0.255.255`
//! (or `224.0.7.x` in legacy mode). IPv6 groups follow RFC 3306
//! unicast-prefix-based addressing:
//!
//! ```text
//! | 8 bits | 4 bits | 4 bits | 8 bits | 8 bits |   64 bits  |  32 bits |
//! +--------+--------+--------+--------+--------+------------+----------+
//! |  0xFF  |  0x3   | scope  |  0x00  | plen   |  prefix    | group id |
//! ```

use if_addrs::IfAddr;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use concord_common::{ClusterError, Result};

/// Longest network prefix that fits the RFC 3306 prefix field
const MAX_PREFIX_BITS: u8 = 64;

/// Derive a group address for a node reachable at `self_address`
pub fn derive_multicast_address(self_address: IpAddr, legacy_ipv4: bool) -> Result<String> {
    let mut rng = rand::rng();
    match self_address {
        IpAddr::V4(_) => Ok(derive_ipv4(&mut rng, legacy_ipv4).to_string()),
        IpAddr::V6(address) => {
            let prefix_len = if address.is_multicast() {
                // A group address carries its own prefix length
                Some(address.octets()[3])
            } else {
                interface_prefix_len(&address)
            };
            let prefix_len = prefix_len.ok_or_else(|| {
                ClusterError::Derivation(format!("no interface prefix length for {address}"))
            })?;
            Ok(derive_ipv6(address, prefix_len, &mut rng)?.to_string())
        }
    }
}

/// Random IPv4 group outside the reserved 224.0.0.x and 224.0.1.x blocks
pub fn derive_ipv4(rng: &mut impl Rng, legacy: bool) -> Ipv4Addr {
    if legacy {
        Ipv4Addr::new(224, 0, 7, rng.random())
    } else {
        Ipv4Addr::new(224, 0, rng.random_range(2..=255), rng.random())
    }
}

/// Multicast scope for an IPv6 address
pub fn ipv6_scope(address: &Ipv6Addr) -> Option<u8> {
    let octets = address.octets();
    if address.is_multicast() {
        return Some(octets[1] & 0x0F);
    }
    if address.is_unspecified() {
        return None;
    }
    if address.is_loopback() {
        return Some(0x1);
    }
    let segment = address.segments()[0];
    if segment & 0xFFC0 == 0xFE80 {
        return Some(0x2); // link-local
    }
    if segment & 0xFFC0 == 0xFEC0 {
        return Some(0x5); // site-local
    }
    Some(0xE)
}

/// Build an RFC 3306 group address from a unicast address and its prefix length.
///
/// The address has room for 64 prefix bits. A longer prefix (up to 128) is
/// truncated to its leading 64 bits and the encoded length is 64; anything
/// over 128 is a `Derivation` error.
pub fn derive_ipv6(address: Ipv6Addr, prefix_len: u8, rng: &mut impl Rng) -> Result<Ipv6Addr> {
    let scope = ipv6_scope(&address)
        .ok_or_else(|| ClusterError::Derivation(format!("no multicast scope for {address}")))?;
    if prefix_len > 128 {
        return Err(ClusterError::Derivation(format!(
            "invalid prefix length {prefix_len}"
        )));
    }
    let prefix_len = prefix_len.min(MAX_PREFIX_BITS);

    let network = if address.is_multicast() {
        // Already unicast-prefix based: the prefix sits in bytes 4..12
        u128::from(address) << 32 & !0u128 << 64
    } else {
        u128::from(address)
    };
    let mask = match prefix_len {
        0 => 0,
        n => !0u128 << (128 - u32::from(n)),
    };
    // prefix_len <= 64, so the masked network fits the 8-byte field
    let prefix = ((network & mask) >> 64) as u64;

    let group_id: u32 = rng.random::<u32>() | 0x8000_0000;

    let mut bytes = [0u8; 16];
    bytes[0] = 0xFF;
    bytes[1] = 0x30 | scope;
    bytes[2] = 0x00;
    bytes[3] = prefix_len;
    bytes[4..12].copy_from_slice(&prefix.to_be_bytes());
    bytes[12..16].copy_from_slice(&group_id.to_be_bytes());
    Ok(Ipv6Addr::from(bytes))
}

/// Prefix length of the local interface carrying `address`
fn interface_prefix_len(address: &Ipv6Addr) -> Option<u8> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .find_map(|iface| match iface.addr {
            IfAddr::V6(v6) if v6.ip == *address => {
                Some(u128::from(v6.netmask).leading_ones() as u8)
            }
            _ => None,
        })
}

/// True when `address` parses as a multicast group address
pub fn is_group_address(address: &str) -> bool {
    address
        .parse::<IpAddr>()
        .map(|ip| ip.is_multicast())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_range() {
        let mut rng = rand::rng();
        for _ in 0..1_000 {
            let octets = derive_ipv4(&mut rng, false).octets();
            assert_eq!(&octets[..2], &[224, 0]);
            assert!(octets[2] >= 2);
        }
    }

    #[test]
    fn test_ipv4_legacy_range() {
        let mut rng = rand::rng();
        for _ in 0..100 {
            let octets = derive_ipv4(&mut rng, true).octets();
            assert_eq!(&octets[..3], &[224, 0, 7]);
        }
    }

    #[test]
    fn test_ipv4_entry_point() {
        let derived = derive_multicast_address("10.1.2.3".parse().unwrap(), false).unwrap();
        assert!(is_group_address(&derived));
        assert!(derived.starts_with("224.0."));
    }

    #[test]
    fn test_ipv6_layout() {
        let mut rng = rand::rng();
        let unicast: Ipv6Addr = "2001:db8:aaaa:bbbb:1:2:3:4".parse().unwrap();
        let group = derive_ipv6(unicast, 48, &mut rng).unwrap();
        let bytes = group.octets();

        assert_eq!(bytes[0], 0xFF);
        assert_eq!(bytes[1] >> 4, 0x3);
        assert_eq!(bytes[1] & 0x0F, 0xE);
        assert_eq!(bytes[2], 0);
        assert_eq!(bytes[3], 48);
        // 48-bit prefix copied, remainder zero padded
        assert_eq!(&bytes[4..12], &[0x20, 0x01, 0x0d, 0xb8, 0xaa, 0xaa, 0, 0]);
        assert!(bytes[12] & 0x80 != 0);
    }

    #[test]
    fn test_ipv6_prefix_clamped_to_64() {
        let mut rng = rand::rng();
        let unicast: Ipv6Addr = "2001:db8:1:2:3:4:5:6".parse().unwrap();
        let group = derive_ipv6(unicast, 120, &mut rng).unwrap();
        let bytes = group.octets();
        assert_eq!(bytes[3], 64);
        assert_eq!(&bytes[4..12], &[0x20, 0x01, 0x0d, 0xb8, 0, 1, 0, 2]);
    }

    #[test]
    fn test_ipv6_scopes() {
        assert_eq!(ipv6_scope(&Ipv6Addr::LOCALHOST), Some(1));
        assert_eq!(ipv6_scope(&"fe80::1".parse().unwrap()), Some(2));
        assert_eq!(ipv6_scope(&"fec0::1".parse().unwrap()), Some(5));
        assert_eq!(ipv6_scope(&"2001:db8::1".parse().unwrap()), Some(14));
        assert_eq!(ipv6_scope(&"ff38::1".parse().unwrap()), Some(8));
        assert_eq!(ipv6_scope(&Ipv6Addr::UNSPECIFIED), None);
    }

    #[test]
    fn test_ipv6_rejects_unspecified_and_bad_prefix() {
        let mut rng = rand::rng();
        assert!(derive_ipv6(Ipv6Addr::UNSPECIFIED, 64, &mut rng).is_err());
        assert!(derive_ipv6("2001:db8::1".parse().unwrap(), 129, &mut rng).is_err());
    }

    #[test]
    fn test_ipv6_from_existing_group_keeps_scope() {
        let mut rng = rand::rng();
        let existing: Ipv6Addr = "ff35:30:2001:db8:aaaa::8000:1".parse().unwrap();
        let group = derive_ipv6(existing, 48, &mut rng).unwrap();
        let bytes = group.octets();
        assert_eq!(bytes[1], 0x35);
        assert_eq!(&bytes[4..10], &[0x20, 0x01, 0x0d, 0xb8, 0xaa, 0xaa]);
    }

    #[test]
    fn test_is_group_address() {
        assert!(is_group_address("224.0.7.9"));
        assert!(is_group_address("ff3e:40:2001:db8::8000:1"));
        assert!(!is_group_address("10.0.0.1"));
        assert!(!is_group_address("garbage"));
    }
}
