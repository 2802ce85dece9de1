//! Label predicate evaluator.
//!
//! A predicate is a top-level conjunction of conditions separated by commas
//! at paren/quote depth zero:
//!
//! ```text
//! env=prod, tier=web, !has(temp), count(replicas) >= 3
//! ```
//!
//! Supported condition forms: `k = v`, `k != v`, `k in (v1, v2)`,
//! `k notin (...)`, `has(k)`, `startswith(k, "s")`, `endswith(k, "s")`,
//! `contains(k, "s")`, `regex(k, "pat")` (anchored at the start of the
//! value), `len(k) OP n`, `count(k) OP n`, bare numeric `k OP n`, `!cond`
//! and `( cond )` grouping.
//!
//! The parser is a hand-written splitter plus per-condition recursive
//! descent into a small [`Condition`] tree; the evaluator pattern-matches
//! the tree. A condition that does not parse evaluates to **false** rather
//! than erroring: fleet selection must not blow up an entire run because
//! one label filter has a typo in it. The empty predicate matches
//! everything.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static COUNT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^count\(\s*([A-Za-z0-9_.\-]+)\s*\)\s*(==|!=|>=|<=|>|<)\s*(\d+)$")
        .expect("valid count regex")
});

static LEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^len\(\s*([A-Za-z0-9_.\-]+)\s*\)\s*(>=|<=|>|<)\s*(\d+)$")
        .expect("valid len regex")
});

static FUNC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\(\s*([A-Za-z0-9_.\-]+)\s*(?:,\s*(.+?)\s*)?\)$")
        .expect("valid function regex")
});

static SET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]+)\s+(in|notin)\s*\(\s*(.*?)\s*\)$")
        .expect("valid set-op regex")
});

static NUM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z0-9_.\-]+)\s*(>=|<=|>|<)\s*(\d+)$").expect("valid numeric regex")
});

// ============================================================================
// CONDITION TREE
// ============================================================================

/// Comparison operators shared by `len`, `count` and bare numeric forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    fn eval(self, left: i64, right: i64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
        }
    }
}

/// One parsed condition.
#[derive(Debug, Clone)]
enum Condition {
    Equals { key: String, value: String },
    NotEquals { key: String, value: String },
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Has { key: String },
    StartsWith { key: String, prefix: String },
    EndsWith { key: String, suffix: String },
    Contains { key: String, needle: String },
    Regex { key: String, pattern: Regex },
    Len { key: String, op: CmpOp, value: i64 },
    Count { key: String, op: CmpOp, value: i64 },
    NumCmp { key: String, op: CmpOp, value: i64 },
    Not(Box<Condition>),
    /// Condition text that matched no known form; evaluates to false.
    Invalid,
}

// ============================================================================
// SELECTOR
// ============================================================================

/// Parsed label predicate. Construction never fails; broken conditions
/// simply match nothing.
#[derive(Debug, Clone)]
pub struct LabelSelector {
    conditions: Vec<Condition>,
}

impl LabelSelector {
    pub fn parse(expression: &str) -> Self {
        let conditions = split_conditions(expression)
            .into_iter()
            .map(|part| parse_condition(&part))
            .collect();
        Self { conditions }
    }

    /// True iff every condition holds for `labels`.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.conditions.iter().all(|c| eval(c, labels))
    }
}

// ============================================================================
// SPLITTING
// ============================================================================

/// Cuts on top-level commas only: commas inside `(...)` or inside single or
/// double quotes belong to the condition.
fn split_conditions(expr: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut buf = String::new();
    let mut depth = 0usize;
    let mut in_quote: Option<char> = None;

    for c in expr.chars() {
        match c {
            '"' | '\'' => {
                match in_quote {
                    None => in_quote = Some(c),
                    Some(q) if q == c => in_quote = None,
                    Some(_) => {}
                }
                buf.push(c);
            }
            '(' if in_quote.is_none() => {
                depth += 1;
                buf.push(c);
            }
            ')' if in_quote.is_none() => {
                depth = depth.saturating_sub(1);
                buf.push(c);
            }
            ',' if depth == 0 && in_quote.is_none() => {
                let part = buf.trim().to_string();
                if !part.is_empty() {
                    parts.push(part);
                }
                buf.clear();
            }
            _ => buf.push(c),
        }
    }
    let part = buf.trim().to_string();
    if !part.is_empty() {
        parts.push(part);
    }
    parts
}

// ============================================================================
// PARSING
// ============================================================================

fn parse_condition(expr: &str) -> Condition {
    let expr = expr.trim();
    if expr.is_empty() {
        return Condition::Invalid;
    }

    // Negation binds tighter than the top-level comma.
    if let Some(inner) = expr.strip_prefix('!') {
        // `!=` at the start is not a negation, it is a broken equality.
        if !inner.starts_with('=') {
            return Condition::Not(Box::new(parse_condition(inner)));
        }
        return Condition::Invalid;
    }

    // Grouping.
    if expr.starts_with('(') && expr.ends_with(')') {
        return parse_condition(&expr[1..expr.len() - 1]);
    }

    // Existence.
    if let Some(key) = expr
        .strip_prefix("has(")
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return Condition::Has {
            key: key.trim().to_string(),
        };
    }

    // count(k) OP n
    if let Some(caps) = COUNT_RE.captures(expr) {
        if let (Some(op), Ok(value)) = (CmpOp::parse(&caps[2]), caps[3].parse::<i64>()) {
            return Condition::Count {
                key: caps[1].to_string(),
                op,
                value,
            };
        }
        return Condition::Invalid;
    }

    // len(k) OP n
    if let Some(caps) = LEN_RE.captures(expr) {
        if let (Some(op), Ok(value)) = (CmpOp::parse(&caps[2]), caps[3].parse::<i64>()) {
            return Condition::Len {
                key: caps[1].to_string(),
                op,
                value,
            };
        }
        return Condition::Invalid;
    }

    // String functions: startswith / endswith / contains / regex.
    if let Some(caps) = FUNC_RE.captures(expr) {
        let func = &caps[1];
        let key = caps[2].to_string();
        let arg = caps.get(3).map(|m| unquote(m.as_str()).to_string());

        return match (func, arg) {
            ("startswith", Some(prefix)) => Condition::StartsWith { key, prefix },
            ("endswith", Some(suffix)) => Condition::EndsWith { key, suffix },
            ("contains", Some(needle)) => Condition::Contains { key, needle },
            ("regex", Some(pattern)) => match Regex::new(&pattern) {
                Ok(pattern) => Condition::Regex { key, pattern },
                // Invalid pattern matches nothing rather than erroring.
                Err(_) => Condition::Invalid,
            },
            _ => Condition::Invalid,
        };
    }

    // Set membership: k in (v1, v2) / k notin (v1, v2).
    if let Some(caps) = SET_RE.captures(expr) {
        let key = caps[1].to_string();
        let values: Vec<String> = caps[3]
            .split(',')
            .map(|v| unquote(v.trim()).to_string())
            .filter(|v| !v.is_empty())
            .collect();
        if values.is_empty() {
            return Condition::Invalid;
        }
        return match &caps[2] {
            "in" => Condition::In { key, values },
            _ => Condition::NotIn { key, values },
        };
    }

    // Bare numeric comparison: k OP n.
    if let Some(caps) = NUM_RE.captures(expr) {
        if let (Some(op), Ok(value)) = (CmpOp::parse(&caps[2]), caps[3].parse::<i64>()) {
            return Condition::NumCmp {
                key: caps[1].to_string(),
                op,
                value,
            };
        }
        return Condition::Invalid;
    }

    // Equality / inequality, tried last so the forms above keep their
    // operators out of the value side.
    if let Some((key, value)) = expr.split_once("!=") {
        return Condition::NotEquals {
            key: key.trim().to_string(),
            value: unquote(value.trim()).to_string(),
        };
    }
    if expr.contains("==") {
        return Condition::Invalid;
    }
    if let Some((key, value)) = expr.split_once('=') {
        return Condition::Equals {
            key: key.trim().to_string(),
            value: unquote(value.trim()).to_string(),
        };
    }

    Condition::Invalid
}

/// Strips one matching pair of surrounding quotes.
fn unquote(text: &str) -> &str {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &text[1..text.len() - 1];
        }
    }
    text
}

// ============================================================================
// EVALUATION
// ============================================================================

fn eval(condition: &Condition, labels: &HashMap<String, String>) -> bool {
    match condition {
        Condition::Equals { key, value } => labels.get(key).map_or(false, |v| v == value),
        // Absent key counts as "differs".
        Condition::NotEquals { key, value } => labels.get(key).map_or(true, |v| v != value),
        Condition::In { key, values } => {
            labels.get(key).map_or(false, |v| values.contains(v))
        }
        Condition::NotIn { key, values } => {
            labels.get(key).map_or(true, |v| !values.contains(v))
        }
        Condition::Has { key } => labels.contains_key(key),
        Condition::StartsWith { key, prefix } => {
            labels.get(key).map_or(false, |v| v.starts_with(prefix))
        }
        Condition::EndsWith { key, suffix } => {
            labels.get(key).map_or(false, |v| v.ends_with(suffix))
        }
        Condition::Contains { key, needle } => {
            labels.get(key).map_or(false, |v| v.contains(needle))
        }
        Condition::Regex { key, pattern } => labels
            .get(key)
            .and_then(|v| pattern.find(v))
            .map_or(false, |m| m.start() == 0),
        Condition::Len { key, op, value } => labels
            .get(key)
            .map_or(false, |v| op.eval(v.len() as i64, *value)),
        Condition::Count { key, op, value } => op.eval(count_of(labels, key), *value),
        Condition::NumCmp { key, op, value } => labels
            .get(key)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map_or(false, |n| op.eval(n, *value)),
        Condition::Not(inner) => !eval(inner, labels),
        Condition::Invalid => false,
    }
}

/// `count(k)`: the integer value of a digit-string label, the string length
/// otherwise, zero when absent.
fn count_of(labels: &HashMap<String, String>, key: &str) -> i64 {
    match labels.get(key) {
        None => 0,
        Some(value) => {
            if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
                value.parse().unwrap_or(value.len() as i64)
            } else {
                value.len() as i64
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    /// Eight-host fixture shared by the selection tests.
    fn fleet() -> Vec<HashMap<String, String>> {
        vec![
            labels(&[("env", "prod"), ("tier", "web"), ("region", "us-east")]), // 0
            labels(&[("env", "dev"), ("tier", "db"), ("region", "us-west")]),   // 1
            labels(&[("env", "staging"), ("tier", "web"), ("region", "us-east")]), // 2
            labels(&[("env", "prod"), ("tier", "api"), ("region", "eu-west")]), // 3
            labels(&[("env", "test"), ("tier", "worker"), ("replicas", "3")]),  // 4
            labels(&[("env", "prod"), ("tier", "web"), ("name", "web-server-01")]), // 5
            labels(&[("env", "prod"), ("tier", "db"), ("backup", "true")]),     // 6
            labels(&[("env", "dev"), ("tier", "web"), ("temp", "true")]),       // 7
        ]
    }

    fn matching(expr: &str) -> Vec<usize> {
        let selector = LabelSelector::parse(expr);
        fleet()
            .iter()
            .enumerate()
            .filter(|(_, l)| selector.matches(l))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_equality() {
        assert_eq!(matching("env=prod"), vec![0, 3, 5, 6]);
        assert_eq!(matching("tier=web"), vec![0, 2, 5, 7]);
        assert_eq!(matching("region=us-east"), vec![0, 2]);
        assert_eq!(matching("nonexistent=value"), Vec::<usize>::new());
    }

    #[test]
    fn test_inequality() {
        assert_eq!(matching("env!=prod"), vec![1, 2, 4, 7]);
        assert_eq!(matching("tier!=web"), vec![1, 3, 4, 6]);
        // Absent key counts as "differs".
        assert_eq!(matching("region!=us-east"), vec![1, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_existence() {
        assert_eq!(matching("has(backup)"), vec![6]);
        assert_eq!(matching("has(temp)"), vec![7]);
        assert_eq!(matching("has(nonexistent)"), Vec::<usize>::new());
        assert_eq!(matching("!has(backup)"), vec![0, 1, 2, 3, 4, 5, 7]);
        assert_eq!(matching("!has(temp)"), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_set_membership() {
        assert_eq!(matching("env in (prod,staging)"), vec![0, 2, 3, 5, 6]);
        assert_eq!(matching("tier in (web,api)"), vec![0, 2, 3, 5, 7]);
        assert_eq!(matching("env notin (dev,test)"), vec![0, 2, 3, 5, 6]);
        assert_eq!(matching("tier notin (db,worker)"), vec![0, 2, 3, 5, 7]);
    }

    #[test]
    fn test_set_membership_spacing_variants() {
        for expr in [
            "env in (prod, staging)",
            "env in (prod,staging)",
            "env in( prod, staging )",
            "env in  (prod, staging)",
        ] {
            assert_eq!(matching(expr), vec![0, 2, 3, 5, 6], "expr: {}", expr);
        }
    }

    #[test]
    fn test_count_comparisons() {
        assert_eq!(matching("count(replicas) > 2"), vec![4]);
        assert_eq!(matching("count(replicas) >= 3"), vec![4]);
        assert_eq!(matching("count(replicas) < 4"), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(
            matching("count(replicas) <= 3"),
            vec![0, 1, 2, 3, 4, 5, 6, 7]
        );
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(matching(r#"startswith(name, "web-")"#), vec![5]);
        assert_eq!(matching(r#"endswith(name, "-01")"#), vec![5]);
        assert_eq!(matching(r#"contains(region, "us")"#), vec![0, 1, 2]);
        assert_eq!(matching("len(name) > 10"), vec![5]);
        assert_eq!(matching(r#"regex(name, "web-server-\d+")"#), vec![5]);
    }

    #[test]
    fn test_regex_is_start_anchored() {
        let selector = LabelSelector::parse(r#"regex(name, "server")"#);
        assert!(!selector.matches(&labels(&[("name", "web-server-01")])));
        assert!(selector.matches(&labels(&[("name", "server-01")])));
    }

    #[test]
    fn test_conjunction() {
        assert_eq!(matching("env=prod, tier=web"), vec![0, 5]);
        assert_eq!(matching("env=prod, region=us-east"), vec![0]);
        assert_eq!(matching("tier=web, has(temp)"), vec![7]);
        assert_eq!(matching("env=staging, tier=web, region=us-east"), vec![2]);
    }

    #[test]
    fn test_unparseable_conditions_match_nothing() {
        for expr in [
            "invalid_function()",
            "env=",
            "=value",
            "env in ()",
            "env in (prod",
            "count()",
            "has(,)",
            "env > string",
        ] {
            assert_eq!(matching(expr), Vec::<usize>::new(), "expr: {}", expr);
        }
    }

    #[test]
    fn test_empty_predicate_matches_everything() {
        assert_eq!(matching(""), vec![0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(matching("   ,   ,   "), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_negation_forms() {
        assert_eq!(matching("!has(backup), !has(temp)"), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(matching("env!=prod, !has(temp)"), vec![1, 2, 4]);
        assert_eq!(matching("!(env=prod), tier=web"), vec![2, 7]);
        // Comma (AND) binds looser than negation.
        assert_eq!(matching("!env=prod, tier=web"), vec![2, 7]);
    }

    #[test]
    fn test_numeric_comparison_edge_cases() {
        // Non-numeric label value: comparison is false, not an error.
        assert_eq!(matching("env > 100"), Vec::<usize>::new());
        // Missing label.
        assert_eq!(matching("nonexistent > 0"), Vec::<usize>::new());
    }

    #[test]
    fn test_invalid_regex_matches_nothing() {
        assert_eq!(matching(r#"regex(name, "[invalid")"#), Vec::<usize>::new());
    }

    #[test]
    fn test_missing_function_argument_matches_nothing() {
        assert_eq!(matching("startswith(name)"), Vec::<usize>::new());
    }

    #[test]
    fn test_long_conjunction() {
        assert_eq!(
            matching("env=prod, tier=web, region=us-east, !has(temp), !has(backup)"),
            vec![0]
        );
    }

    #[test]
    fn test_quoted_values_with_commas() {
        let special = labels(&[("key", "value,with,commas"), ("special", "test@#")]);

        let selector = LabelSelector::parse(r#"key="value,with,commas""#);
        assert!(selector.matches(&special));

        let selector = LabelSelector::parse("special=test@#");
        assert!(selector.matches(&special));
    }

    #[test]
    fn test_count_of_coercion() {
        let l = labels(&[("replicas", "12"), ("name", "abc")]);
        assert_eq!(count_of(&l, "replicas"), 12);
        assert_eq!(count_of(&l, "name"), 3);
        assert_eq!(count_of(&l, "missing"), 0);
    }

    #[test]
    fn test_split_conditions_respects_quotes_and_parens() {
        let parts = split_conditions(r#"a="x,y", b in (1, 2), c=3"#);
        assert_eq!(parts, vec![r#"a="x,y""#, "b in (1, 2)", "c=3"]);
    }
}
