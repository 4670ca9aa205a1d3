//! Literal encoders: turn textual value lists into dialect-correct literals.

use crate::{
    error::{QuerierError, Result},
    operator::Operator,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// OUI prepended to bare tap_port MAC suffixes.
const TAP_PORT_MAC_PREFIX: &str = "00:00:";

/// Splits `(a, 'b', c)` or a scalar into trimmed items, honouring quotes.
pub fn split_values(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let inner = if trimmed.starts_with('(') && trimmed.ends_with(')') && trimmed.len() >= 2 {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote = None;

    for ch in inner.chars() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            current.push(ch);
            continue;
        }

        match ch {
            '\'' | '"' => {
                quote = Some(ch);
                current.push(ch);
            }
            ',' => {
                items.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    if !current.trim().is_empty() {
        items.push(current.trim().to_string());
    }

    items.retain(|item| !item.is_empty());
    items
}

/// Strips surrounding whitespace and single/double quotes.
pub fn unquote(value: &str) -> &str {
    value.trim().trim_matches('\'').trim_matches('"')
}

/// Quotes a string literal for ClickHouse.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Joins encoded items: parenthesised for list operators, a single scalar otherwise.
pub fn join_for(op: Operator, tag: &str, items: Vec<String>) -> Result<String> {
    if op.is_list() {
        return Ok(format!("({})", items.join(",")));
    }

    match <[String; 1]>::try_from(items) {
        Ok([single]) => Ok(single),
        Err(items) => Err(QuerierError::malformed(
            tag,
            items.join(","),
            format!("operator '{op}' expects a single value"),
        )),
    }
}

/// Parses a 48-bit MAC in `aa:bb:cc:dd:ee:ff`, `aa-bb-…` or `aabb.ccdd.eeff` form.
pub fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let value = value.trim();
    let digits: String = if value.contains('.') {
        let groups: Vec<_> = value.split('.').collect();
        if groups.len() != 3 || groups.iter().any(|g| g.len() != 4) {
            return None;
        }
        groups.concat()
    } else {
        let separator = if value.contains('-') { '-' } else { ':' };
        let groups: Vec<_> = value.split(separator).collect();
        if groups.len() != 6 || groups.iter().any(|g| g.len() != 2) {
            return None;
        }
        groups.concat()
    };

    let mut mac = [0u8; 6];
    for (idx, byte) in mac.iter_mut().enumerate() {
        *byte = u8::from_str_radix(digits.get(idx * 2..idx * 2 + 2)?, 16).ok()?;
    }
    Some(mac)
}

pub fn mac_to_u64(mac: [u8; 6]) -> u64 {
    mac.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
}

/// Canonical lowercase colon form of the low 48 bits.
pub fn u64_to_mac(value: u64) -> String {
    let bytes = value.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Encodes MAC literals as unsigned 64-bit integers.
pub fn encode_macs(tag: &str, op: Operator, raw: &str) -> Result<String> {
    let items = split_values(raw)
        .iter()
        .map(|item| {
            let literal = unquote(item);
            parse_mac(literal)
                .map(|mac| mac_to_u64(mac).to_string())
                .ok_or_else(|| QuerierError::malformed(tag, item.as_str(), "invalid MAC address"))
        })
        .collect::<Result<Vec<_>>>()?;
    join_for(op, tag, items)
}

/// Classifies each tap_port element: IPv4 as u32, a bare MAC suffix as u64, anything else opaque.
pub fn encode_tap_ports(tag: &str, op: Operator, raw: &str) -> Result<String> {
    let items = split_values(raw)
        .iter()
        .map(|item| {
            let literal = unquote(item);
            match literal.parse::<IpAddr>() {
                Ok(IpAddr::V4(ip)) => Ok(u32::from(ip).to_string()),
                Ok(IpAddr::V6(_)) => Err(QuerierError::malformed(
                    tag,
                    item.as_str(),
                    "tap_port only accepts IPv4 addresses",
                )),
                Err(_) => Ok(parse_mac(&format!("{TAP_PORT_MAC_PREFIX}{literal}"))
                    .map(|mac| mac_to_u64(mac).to_string())
                    .unwrap_or_else(|| quote(literal))),
            }
        })
        .collect::<Result<Vec<_>>>()?;
    join_for(op, tag, items)
}

/// Hex literal matching the hex-encoded IP columns.
pub fn ip_hex(tag: &str, literal: &str) -> Result<String> {
    let text = unquote(literal);
    match text.parse::<IpAddr>() {
        Ok(ip) => Ok(hex_of(ip)),
        Err(_) => Err(QuerierError::malformed(tag, literal, "invalid IP address")),
    }
}

fn hex_of(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("hex(toIPv4('{v4}'))"),
        IpAddr::V6(v6) => format!("hex(toIPv6('{v6}'))"),
    }
}

/// Inclusive address range of a CIDR prefix, masked to its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrRange {
    pub first: IpAddr,
    pub last: IpAddr,
}

impl CidrRange {
    pub fn parse(tag: &str, literal: &str) -> Result<Self> {
        let text = unquote(literal);
        let malformed = |reason: &str| QuerierError::malformed(tag, literal, reason);
        let (addr, prefix) = text
            .split_once('/')
            .ok_or_else(|| malformed("missing prefix length"))?;
        let prefix: u32 = prefix
            .trim()
            .parse()
            .map_err(|_| malformed("invalid prefix length"))?;
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| malformed("invalid network address"))?;

        match addr {
            IpAddr::V4(v4) => {
                if prefix > 32 {
                    return Err(malformed("IPv4 prefix exceeds 32 bits"));
                }
                let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
                let first = u32::from(v4) & mask;
                Ok(Self {
                    first: IpAddr::V4(Ipv4Addr::from(first)),
                    last: IpAddr::V4(Ipv4Addr::from(first | !mask)),
                })
            }
            IpAddr::V6(v6) => {
                if prefix > 128 {
                    return Err(malformed("IPv6 prefix exceeds 128 bits"));
                }
                let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
                let first = u128::from(v6) & mask;
                Ok(Self {
                    first: IpAddr::V6(Ipv6Addr::from(first)),
                    last: IpAddr::V6(Ipv6Addr::from(first | !mask)),
                })
            }
        }
    }

    pub fn first_hex(&self) -> String {
        hex_of(self.first)
    }

    pub fn last_hex(&self) -> String {
        hex_of(self.last)
    }
}

/// Which truth values a boolean tag filter mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TruthSet {
    pub has_true: bool,
    pub has_false: bool,
}

impl TruthSet {
    pub fn from_values(raw: &str) -> Self {
        split_values(raw)
            .iter()
            .fold(TruthSet::default(), |mut set, item| {
                if unquote(item) == "1" {
                    set.has_true = true;
                } else {
                    set.has_false = true;
                }
                set
            })
    }

    /// No truth value was mentioned, e.g. `in ()`.
    pub fn is_empty(&self) -> bool {
        !self.has_true && !self.has_false
    }

    pub fn is_tautology(&self) -> bool {
        self.has_true && self.has_false
    }
}

/// Maps `ip_version` values onto the `is_ipv4` flag: 4 → 1, anything else → 0.
pub fn encode_ip_versions(tag: &str, op: Operator, raw: &str) -> Result<String> {
    let items = split_values(raw)
        .iter()
        .map(|item| {
            if unquote(item) == "4" {
                "1".to_string()
            } else {
                "0".to_string()
            }
        })
        .collect();
    join_for(op, tag, items)
}

pub fn parse_ids(tag: &str, raw: &str) -> Result<Vec<u64>> {
    split_values(raw)
        .iter()
        .map(|item| {
            unquote(item)
                .parse::<u64>()
                .map_err(|_| QuerierError::malformed(tag, item.as_str(), "expected an integer id"))
        })
        .collect()
}
