//! IP expression evaluator.
//!
//! A mini-language over IPv4 addresses used to pick targets out of the
//! inventory:
//!
//! ```text
//! 192.168.1.1                          single address
//! 192.168.1.0/24                       CIDR block
//! 192.168.1.1-192.168.1.100            inclusive range
//! 192.[22:26,33].[95:99].1             field enumeration (per-octet sets)
//! 192.168.1.0/24,10.0.0.1-10.0.0.50    union (top-level comma)
//! 192.168.1.0/24 !192.168.1.100        union minus exclusion union
//! ```
//!
//! Commas inside `[...]` belong to the octet spec, so the union splitter
//! tracks bracket depth. Membership tests never materialise the set:
//! address and CIDR primitives answer in O(1), field enumerations in O(4)
//! per-octet lookups. `expand` enumerates lazily with bounded
//! deduplication memory.
//!
//! CIDR semantics: `matches` uses full network containment (network and
//! broadcast included); `expand` yields *host* addresses only, so a `/30`
//! expands to exactly 2 addresses.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use thiserror::Error;

use crate::errors::ErrorCode;

/// Default cap for [`IpSelector::expand`] and for the dedup cache.
pub const DEFAULT_EXPAND_LIMIT: usize = 10_000;

// ============================================================================
// ERRORS
// ============================================================================

/// Parse failure in an IP expression. Always an operator mistake, so these
/// surface as hard errors instead of per-host results.
#[derive(Debug, Error)]
pub enum IpExprError {
    /// not a valid IPv4 address: `{0}`
    #[error("not a valid IPv4 address: '{0}'")]
    InvalidAddress(String),

    /// octet outside 0..=255
    #[error("octet value out of range in '{0}'")]
    InvalidOctet(String),

    /// bad CIDR notation or prefix above /32
    #[error("invalid CIDR block: '{0}'")]
    InvalidCidr(String),

    /// range start above range end
    #[error("reversed range: '{0}'")]
    ReversedRange(String),

    /// `[...]` spec that does not parse, or wrong field count
    #[error("malformed field enumeration: '{0}'")]
    MalformedFieldSpec(String),
}

impl IpExprError {
    /// Structured code for this failure class.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidAddress(_) => ErrorCode::INVALID_IP_EXPRESSION,
            Self::InvalidOctet(_) => ErrorCode::INVALID_OCTET,
            Self::InvalidCidr(_) => ErrorCode::INVALID_CIDR,
            Self::ReversedRange(_) => ErrorCode::REVERSED_RANGE,
            Self::MalformedFieldSpec(_) => ErrorCode::MALFORMED_FIELD_SPEC,
        }
    }
}

// ============================================================================
// PRIMITIVES
// ============================================================================

/// One inclusion or exclusion term of the expression.
#[derive(Debug, Clone)]
enum IpPrimitive {
    Single(Ipv4Addr),
    Cidr(Ipv4Net),
    Range { start: Ipv4Addr, end: Ipv4Addr },
    FieldEnum(FieldEnum),
}

impl IpPrimitive {
    fn contains(&self, addr: Ipv4Addr) -> bool {
        match self {
            Self::Single(a) => *a == addr,
            Self::Cidr(net) => net.contains(&addr),
            Self::Range { start, end } => *start <= addr && addr <= *end,
            Self::FieldEnum(fields) => fields.contains(addr),
        }
    }

    /// Lazy enumeration. CIDRs yield host addresses only; ranges and field
    /// enumerations include their endpoints.
    fn addresses(&self) -> Box<dyn Iterator<Item = Ipv4Addr> + '_> {
        match self {
            Self::Single(a) => Box::new(std::iter::once(*a)),
            Self::Cidr(net) => Box::new(net.hosts()),
            Self::Range { start, end } => {
                Box::new((u32::from(*start)..=u32::from(*end)).map(Ipv4Addr::from))
            }
            Self::FieldEnum(fields) => fields.addresses(),
        }
    }
}

/// Cartesian product over four per-octet value sets.
///
/// Value vectors are sorted and deduplicated at parse time, so membership
/// is a binary search per octet and enumeration order is ascending.
#[derive(Debug, Clone)]
struct FieldEnum {
    octets: [Vec<u8>; 4],
}

impl FieldEnum {
    fn contains(&self, addr: Ipv4Addr) -> bool {
        self.octets
            .iter()
            .zip(addr.octets())
            .all(|(values, octet)| values.binary_search(&octet).is_ok())
    }

    fn addresses(&self) -> Box<dyn Iterator<Item = Ipv4Addr> + '_> {
        let [a, b, c, d] = [&self.octets[0], &self.octets[1], &self.octets[2], &self.octets[3]];
        Box::new(a.iter().flat_map(move |&oa| {
            b.iter().flat_map(move |&ob| {
                c.iter().flat_map(move |&oc| {
                    d.iter().map(move |&od| Ipv4Addr::new(oa, ob, oc, od))
                })
            })
        }))
    }
}

// ============================================================================
// SELECTOR
// ============================================================================

/// Parsed IP expression: inclusion union minus exclusion union.
#[derive(Debug, Clone)]
pub struct IpSelector {
    includes: Vec<IpPrimitive>,
    excludes: Vec<IpPrimitive>,
}

impl IpSelector {
    /// Parses an expression. The empty expression is valid and matches
    /// nothing (selector composition treats "" as "unrestricted" before it
    /// ever reaches this type).
    pub fn parse(expression: &str) -> Result<Self, IpExprError> {
        let expression = expression.trim();
        let (include_part, exclude_part) = match expression.split_once('!') {
            Some((inc, exc)) => (inc.trim(), Some(exc.trim())),
            None => (expression, None),
        };

        let includes = parse_union(include_part)?;
        let excludes = match exclude_part {
            Some(part) => parse_union(part)?,
            None => Vec::new(),
        };

        Ok(Self { includes, excludes })
    }

    /// True iff `addr` is inside some inclusion and inside no exclusion.
    /// A string that is not a dotted quad matches nothing.
    pub fn matches(&self, addr: &str) -> bool {
        let addr: Ipv4Addr = match addr.trim().parse() {
            Ok(a) => a,
            Err(_) => return false,
        };

        if !self.includes.iter().any(|p| p.contains(addr)) {
            return false;
        }
        !self.excludes.iter().any(|p| p.contains(addr))
    }

    /// Up to `limit` addresses of the set, unique and sorted ascending by
    /// numeric value.
    ///
    /// Enumeration is streaming; the recently-seen cache is capped at
    /// `min(2 * limit, 10_000)` entries, and a final sort+dedup pass keeps
    /// the ordering guarantee even when the cache evicted an entry.
    pub fn expand(&self, limit: usize) -> Vec<String> {
        if limit == 0 {
            return Vec::new();
        }
        let cache_size = limit.saturating_mul(2).min(DEFAULT_EXPAND_LIMIT);

        let mut seen: HashSet<Ipv4Addr> = HashSet::new();
        let mut eviction_order: VecDeque<Ipv4Addr> = VecDeque::new();
        let mut collected: Vec<Ipv4Addr> = Vec::new();

        'primitives: for primitive in &self.includes {
            for addr in primitive.addresses() {
                if seen.contains(&addr) {
                    continue;
                }
                seen.insert(addr);
                eviction_order.push_back(addr);
                if eviction_order.len() > cache_size {
                    if let Some(oldest) = eviction_order.pop_front() {
                        seen.remove(&oldest);
                    }
                }

                if self.excludes.iter().any(|p| p.contains(addr)) {
                    continue;
                }

                collected.push(addr);
                if collected.len() >= limit {
                    break 'primitives;
                }
            }
        }

        collected.sort_unstable();
        collected.dedup();
        collected.iter().map(Ipv4Addr::to_string).collect()
    }
}

// ============================================================================
// PARSING
// ============================================================================

/// Splits a union on commas, ignoring commas inside `[...]`.
fn split_union(expr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;

    for c in expr.chars() {
        match c {
            '[' => {
                bracket_depth += 1;
                current.push(c);
            }
            ']' => {
                bracket_depth = bracket_depth.saturating_sub(1);
                current.push(c);
            }
            ',' if bracket_depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn parse_union(expr: &str) -> Result<Vec<IpPrimitive>, IpExprError> {
    let mut primitives = Vec::new();
    for part in split_union(expr) {
        if part.is_empty() {
            continue;
        }
        primitives.push(parse_primitive(&part)?);
    }
    Ok(primitives)
}

fn parse_primitive(part: &str) -> Result<IpPrimitive, IpExprError> {
    if part.contains('[') || part.contains(']') {
        return parse_field_enum(part);
    }

    if part.contains('-') && !part.contains('/') {
        let (start_str, end_str) = part
            .split_once('-')
            .ok_or_else(|| IpExprError::InvalidAddress(part.to_string()))?;
        let start = parse_addr(start_str)?;
        let end = parse_addr(end_str)?;
        if start > end {
            return Err(IpExprError::ReversedRange(part.to_string()));
        }
        return Ok(IpPrimitive::Range { start, end });
    }

    if part.contains('/') {
        let net: Ipv4Net = part
            .trim()
            .parse()
            .map_err(|_| IpExprError::InvalidCidr(part.to_string()))?;
        return Ok(IpPrimitive::Cidr(net.trunc()));
    }

    Ok(IpPrimitive::Single(parse_addr(part)?))
}

fn parse_addr(text: &str) -> Result<Ipv4Addr, IpExprError> {
    text.trim()
        .parse()
        .map_err(|_| IpExprError::InvalidAddress(text.trim().to_string()))
}

fn parse_field_enum(part: &str) -> Result<IpPrimitive, IpExprError> {
    let fields: Vec<&str> = part.split('.').collect();
    if fields.len() != 4 {
        return Err(IpExprError::MalformedFieldSpec(part.to_string()));
    }

    let mut octets: [Vec<u8>; 4] = Default::default();
    for (slot, field) in octets.iter_mut().zip(fields.iter().copied()) {
        *slot = parse_octet_spec(field)?;
    }
    Ok(IpPrimitive::FieldEnum(FieldEnum { octets }))
}

/// One octet position: a literal, or `[v, a:b, ...]`.
fn parse_octet_spec(field: &str) -> Result<Vec<u8>, IpExprError> {
    let field = field.trim();

    let Some(inner) = field
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    else {
        let value = parse_octet_value(field)?;
        return Ok(vec![value]);
    };

    let mut values: Vec<u8> = Vec::new();
    for item in inner.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return Err(IpExprError::MalformedFieldSpec(field.to_string()));
        }
        match item.split_once(':') {
            Some((start_str, end_str)) => {
                let start = parse_octet_value(start_str)?;
                let end = parse_octet_value(end_str)?;
                if start > end {
                    return Err(IpExprError::ReversedRange(item.to_string()));
                }
                values.extend(start..=end);
            }
            None => values.push(parse_octet_value(item)?),
        }
    }

    if values.is_empty() {
        return Err(IpExprError::MalformedFieldSpec(field.to_string()));
    }
    values.sort_unstable();
    values.dedup();
    Ok(values)
}

fn parse_octet_value(text: &str) -> Result<u8, IpExprError> {
    let text = text.trim();
    let value: u32 = text
        .parse()
        .map_err(|_| IpExprError::MalformedFieldSpec(text.to_string()))?;
    u8::try_from(value).map_err(|_| IpExprError::InvalidOctet(text.to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_ip() {
        let selector = IpSelector::parse("192.168.1.1").unwrap();

        assert!(selector.matches("192.168.1.1"));
        assert!(!selector.matches("192.168.1.2"));
        assert_eq!(selector.expand(DEFAULT_EXPAND_LIMIT), vec!["192.168.1.1"]);
    }

    #[test]
    fn test_cidr() {
        let selector = IpSelector::parse("192.168.1.0/24").unwrap();

        assert!(selector.matches("192.168.1.1"));
        assert!(selector.matches("192.168.1.100"));
        assert!(selector.matches("192.168.1.254"));
        assert!(!selector.matches("192.168.0.1"));
        assert!(!selector.matches("192.168.2.1"));

        let ips = selector.expand(5);
        assert_eq!(ips.len(), 5);
        assert_eq!(ips[0], "192.168.1.1");
        assert_eq!(ips[1], "192.168.1.2");
    }

    #[test]
    fn test_cidr_host_enumeration_excludes_network_and_broadcast() {
        let selector = IpSelector::parse("192.168.1.0/30").unwrap();

        // Containment still covers the whole block.
        assert!(selector.matches("192.168.1.0"));
        assert!(selector.matches("192.168.1.3"));

        // Enumeration yields host addresses only.
        assert_eq!(
            selector.expand(DEFAULT_EXPAND_LIMIT),
            vec!["192.168.1.1", "192.168.1.2"]
        );
    }

    #[test]
    fn test_ip_range() {
        let selector = IpSelector::parse("192.168.1.1-192.168.1.5").unwrap();

        assert!(selector.matches("192.168.1.1"));
        assert!(selector.matches("192.168.1.3"));
        assert!(selector.matches("192.168.1.5"));
        assert!(!selector.matches("192.168.1.0"));
        assert!(!selector.matches("192.168.1.6"));

        assert_eq!(
            selector.expand(DEFAULT_EXPAND_LIMIT),
            vec![
                "192.168.1.1",
                "192.168.1.2",
                "192.168.1.3",
                "192.168.1.4",
                "192.168.1.5",
            ]
        );
    }

    #[test]
    fn test_ip_list() {
        let selector = IpSelector::parse("192.168.1.1,192.168.1.5,192.168.1.10").unwrap();

        assert!(selector.matches("192.168.1.1"));
        assert!(selector.matches("192.168.1.5"));
        assert!(selector.matches("192.168.1.10"));
        assert!(!selector.matches("192.168.1.2"));

        assert_eq!(
            selector.expand(DEFAULT_EXPAND_LIMIT),
            vec!["192.168.1.1", "192.168.1.5", "192.168.1.10"]
        );
    }

    #[test]
    fn test_exclusion() {
        let selector =
            IpSelector::parse("192.168.1.0/24 !192.168.1.100,192.168.1.101").unwrap();

        assert!(selector.matches("192.168.1.1"));
        assert!(selector.matches("192.168.1.99"));
        assert!(selector.matches("192.168.1.102"));
        assert!(!selector.matches("192.168.1.100"));
        assert!(!selector.matches("192.168.1.101"));

        let ips = selector.expand(103);
        assert!(!ips.contains(&"192.168.1.100".to_string()));
        assert!(!ips.contains(&"192.168.1.101".to_string()));
        assert!(ips.contains(&"192.168.1.99".to_string()));
        assert!(ips.contains(&"192.168.1.102".to_string()));
    }

    #[test]
    fn test_field_enum_colon_ranges() {
        let selector = IpSelector::parse("192.[22:24].[1:3].1").unwrap();

        assert!(selector.matches("192.22.1.1"));
        assert!(selector.matches("192.23.2.1"));
        assert!(selector.matches("192.24.3.1"));
        assert!(!selector.matches("192.21.1.1"));
        assert!(!selector.matches("192.25.1.1"));
        assert!(!selector.matches("192.22.4.1"));

        let ips = selector.expand(DEFAULT_EXPAND_LIMIT);
        assert_eq!(ips.len(), 9);
        assert!(ips.contains(&"192.22.1.1".to_string()));
        assert!(ips.contains(&"192.24.3.1".to_string()));
    }

    #[test]
    fn test_field_enum_comma_values() {
        let selector = IpSelector::parse("192.[22,24].[1,3].1").unwrap();

        assert!(selector.matches("192.22.1.1"));
        assert!(selector.matches("192.24.3.1"));
        assert!(!selector.matches("192.23.1.1"));
        assert!(!selector.matches("192.22.2.1"));

        assert_eq!(selector.expand(DEFAULT_EXPAND_LIMIT).len(), 4);
    }

    #[test]
    fn test_field_enum_mixed_items() {
        let selector = IpSelector::parse("192.[22:24,26].[1,3:5].1").unwrap();

        assert!(selector.matches("192.22.1.1"));
        assert!(selector.matches("192.22.5.1"));
        assert!(selector.matches("192.26.1.1"));
        assert!(!selector.matches("192.25.1.1"));
        assert!(!selector.matches("192.22.2.1"));
        assert!(!selector.matches("192.22.6.1"));

        // 4 second-octet values x 4 third-octet values.
        assert_eq!(selector.expand(DEFAULT_EXPAND_LIMIT).len(), 16);
    }

    #[test]
    fn test_field_enum_first_octet_bracketed() {
        let selector = IpSelector::parse("[0:1].[0:1].[0:1].[0:1]").unwrap();
        assert!(selector.matches("0.0.0.0"));
        assert!(selector.matches("1.1.1.1"));
        assert!(!selector.matches("2.2.2.2"));
        assert_eq!(selector.expand(DEFAULT_EXPAND_LIMIT).len(), 16);
    }

    #[test]
    fn test_mixed_expression() {
        let selector =
            IpSelector::parse("192.168.1.0/30,10.0.0.1-10.0.0.3,172.[16:17].0.1").unwrap();

        assert!(selector.matches("192.168.1.0"));
        assert!(selector.matches("192.168.1.3"));
        assert!(selector.matches("10.0.0.1"));
        assert!(selector.matches("172.17.0.1"));
        assert!(!selector.matches("192.168.1.4"));
        assert!(!selector.matches("10.0.0.4"));
        assert!(!selector.matches("172.18.0.1"));

        // 2 CIDR hosts + 3 range + 2 field-enum addresses.
        assert_eq!(selector.expand(DEFAULT_EXPAND_LIMIT).len(), 7);
    }

    #[test]
    fn test_mixed_with_exclusion() {
        let selector =
            IpSelector::parse("192.168.1.0/30,10.0.0.1-10.0.0.3 !192.168.1.1,10.0.0.2")
                .unwrap();

        assert!(selector.matches("192.168.1.2"));
        assert!(selector.matches("10.0.0.1"));
        assert!(!selector.matches("192.168.1.1"));
        assert!(!selector.matches("10.0.0.2"));

        let ips = selector.expand(DEFAULT_EXPAND_LIMIT);
        assert!(!ips.contains(&"192.168.1.1".to_string()));
        assert!(!ips.contains(&"10.0.0.2".to_string()));
        assert!(ips.contains(&"192.168.1.2".to_string()));
        assert!(ips.contains(&"10.0.0.1".to_string()));
    }

    #[test]
    fn test_unparseable_address_matches_nothing() {
        let selector = IpSelector::parse("192.168.1.1").unwrap();

        assert!(!selector.matches("256.168.1.1"));
        assert!(!selector.matches("192.168.1"));
        assert!(!selector.matches("192.168.1.1.1"));
        assert!(!selector.matches("not.an.ip.address"));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(IpSelector::parse("192.168.1.0/33").is_err());
        assert!(IpSelector::parse("192.168.1.300-192.168.1.1").is_err());
        assert!(IpSelector::parse("192.168.1.5-192.168.1.1").is_err());
        assert!(IpSelector::parse("192.[22:266].1.1").is_err());
        assert!(IpSelector::parse("192.abc.1.1").is_err());
        assert!(IpSelector::parse("192.[22:26].1").is_err());
        assert!(IpSelector::parse("192.[20:22].[]").is_err());
    }

    #[test]
    fn test_error_codes() {
        let err = IpSelector::parse("192.[22:266].1.1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::INVALID_OCTET);

        let err = IpSelector::parse("192.168.1.5-192.168.1.1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::REVERSED_RANGE);

        let err = IpSelector::parse("192.168.1.0/40").unwrap_err();
        assert_eq!(err.code(), ErrorCode::INVALID_CIDR);
    }

    #[test]
    fn test_whitespace_tolerance() {
        let selector =
            IpSelector::parse("  192.168.1.1 , 192.168.1.2  !  192.168.1.3  ").unwrap();

        assert!(selector.matches("192.168.1.1"));
        assert!(selector.matches("192.168.1.2"));
        assert!(!selector.matches("192.168.1.3"));
    }

    #[test]
    fn test_empty_expression() {
        let selector = IpSelector::parse("").unwrap();
        assert!(!selector.matches("192.168.1.1"));
        assert!(selector.expand(DEFAULT_EXPAND_LIMIT).is_empty());
    }

    #[test]
    fn test_expand_limit() {
        let selector = IpSelector::parse("192.168.1.0/24").unwrap();

        assert_eq!(selector.expand(5).len(), 5);
        assert_eq!(selector.expand(0).len(), 0);
        assert_eq!(selector.expand(DEFAULT_EXPAND_LIMIT).len(), 254);
    }

    #[test]
    fn test_large_range_stays_lazy() {
        let selector = IpSelector::parse("10.0.0.0/8").unwrap();
        assert_eq!(selector.expand(10_000).len(), 10_000);
        assert!(selector.matches("10.200.3.4"));

        let selector = IpSelector::parse("10.[0:255].[0:255].[0:255]").unwrap();
        assert_eq!(selector.expand(10_000).len(), 10_000);
        assert!(selector.matches("10.255.255.255"));
        assert!(!selector.matches("11.0.0.0"));
    }

    #[test]
    fn test_expansion_is_sorted_numerically() {
        let selector = IpSelector::parse("192.168.1.5,192.168.1.1,192.168.1.3").unwrap();
        assert_eq!(
            selector.expand(DEFAULT_EXPAND_LIMIT),
            vec!["192.168.1.1", "192.168.1.3", "192.168.1.5"]
        );

        let selector = IpSelector::parse("192.168.2.1,192.168.1.1").unwrap();
        assert_eq!(
            selector.expand(DEFAULT_EXPAND_LIMIT),
            vec!["192.168.1.1", "192.168.2.1"]
        );
    }

    #[test]
    fn test_expansion_deduplicates_across_primitives() {
        let selector = IpSelector::parse("192.168.1.1,192.168.1.1").unwrap();
        assert_eq!(selector.expand(DEFAULT_EXPAND_LIMIT), vec!["192.168.1.1"]);

        let selector =
            IpSelector::parse("192.168.1.0/30,192.168.1.1-192.168.1.3").unwrap();
        assert_eq!(
            selector.expand(DEFAULT_EXPAND_LIMIT),
            vec!["192.168.1.1", "192.168.1.2", "192.168.1.3"]
        );
    }

    #[test]
    fn test_expand_matches_agreement() {
        // Every expanded address must satisfy matches().
        let selector =
            IpSelector::parse("192.168.1.0/29,10.0.0.1-10.0.0.4 !192.168.1.2").unwrap();
        for ip in selector.expand(DEFAULT_EXPAND_LIMIT) {
            assert!(selector.matches(&ip), "expanded {} must match", ip);
        }
    }
}
