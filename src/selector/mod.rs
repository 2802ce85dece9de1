//! Target selection: IP-set expressions intersected with label predicates.
//!
//! `select_hosts` narrows an inventory down to the hosts an operation
//! should fan out to. Either axis may be empty, meaning "unrestricted";
//! `select_hosts(hosts, "", "")` is the identity. A broken IP expression is
//! an operator mistake and surfaces as an error; a broken label condition
//! just selects nothing (see [`label`]).

pub mod ip;
pub mod label;

pub use ip::{IpExprError, IpSelector, DEFAULT_EXPAND_LIMIT};
pub use label::LabelSelector;

use crate::protocol::Host;

/// Filters `hosts`, preserving input order, to those whose address matches
/// `ip_expr` (if non-empty) and whose labels satisfy `label_expr` (if
/// non-empty).
pub fn select_hosts(
    hosts: &[Host],
    ip_expr: &str,
    label_expr: &str,
) -> Result<Vec<Host>, IpExprError> {
    let ip_selector = match ip_expr.trim() {
        "" => None,
        expr => Some(IpSelector::parse(expr)?),
    };
    let label_selector = match label_expr.trim() {
        "" => None,
        expr => Some(LabelSelector::parse(expr)),
    };

    Ok(hosts
        .iter()
        .filter(|host| {
            ip_selector
                .as_ref()
                .map_or(true, |s| s.matches(&host.host))
                && label_selector
                    .as_ref()
                    .map_or(true, |s| s.matches(&host.labels))
        })
        .cloned()
        .collect())
}
