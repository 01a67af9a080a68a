//! Declared address extraction from device configuration text.
//!
//! Each strategy is independent and returns an optional match; the chain
//! tries them in order and the first hit wins.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

/// Hostname-ish scalar: IPv4/IPv6 literals and DNS names
static HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]*$").expect("valid regex"));

/// Substitution keys that look like they carry an address
static ADDRESS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z0-9_]*(ip|address|host)[a-z0-9_]*$").expect("valid regex"));

/// One way of finding a declared address in a configuration unit
pub trait AddressExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, text: &str) -> Option<String>;
}

/// A single-line `field: value` anywhere in the file
pub struct DirectField {
    fields: Vec<String>,
}

impl DirectField {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl AddressExtractor for DirectField {
    fn name(&self) -> &'static str {
        "direct_field"
    }

    fn extract(&self, text: &str) -> Option<String> {
        text.lines().find_map(|line| {
            let (key, value) = split_key_value(line)?;
            if self.fields.iter().any(|f| f == key) {
                clean_host(value)
            } else {
                None
            }
        })
    }
}

/// A named field inside a nested block, e.g. `manual_ip:` → `static_ip:`.
///
/// The field may sit on the block's own line (flow style) or on any
/// following line indented deeper than the block key.
pub struct NestedBlockField {
    block: String,
    field: String,
    inline_re: Regex,
}

impl NestedBlockField {
    pub fn new(block: &str, field: &str) -> Self {
        let inline_re = Regex::new(&format!(
            r#"(?:^|[\s{{,]){}\s*:\s*("[^"]*"|'[^']*'|[^\s,}}#]+)"#,
            regex::escape(field)
        ))
        .expect("valid regex");
        Self {
            block: block.to_string(),
            field: field.to_string(),
            inline_re,
        }
    }
}

impl AddressExtractor for NestedBlockField {
    fn name(&self) -> &'static str {
        "nested_block_field"
    }

    fn extract(&self, text: &str) -> Option<String> {
        let lines: Vec<&str> = text.lines().collect();

        for (idx, line) in lines.iter().enumerate() {
            let Some((key, rest)) = split_key_value_raw(line) else {
                continue;
            };
            if key != self.block {
                continue;
            }

            if let Some(found) = self
                .inline_re
                .captures(rest)
                .and_then(|c| c.get(1))
                .and_then(|m| clean_host(m.as_str()))
            {
                return Some(found);
            }

            let block_indent = indent_of(line);
            for inner in block_body(&lines[idx + 1..], block_indent) {
                if let Some((inner_key, value)) = split_key_value(inner) {
                    if inner_key == self.field {
                        if let Some(found) = clean_host(value) {
                            return Some(found);
                        }
                    }
                }
            }
        }

        None
    }
}

/// Any address-like key inside the top-level `substitutions:` block
pub struct SubstitutionField;

impl AddressExtractor for SubstitutionField {
    fn name(&self) -> &'static str {
        "substitution_field"
    }

    fn extract(&self, text: &str) -> Option<String> {
        substitutions(text).into_iter().find_map(|(key, value)| {
            if !ADDRESS_KEY_RE.is_match(&key) {
                return None;
            }
            let value = clean_host(&value)?;
            value.parse::<IpAddr>().ok().map(|_| value)
        })
    }
}

/// Ordered list of strategies, first match wins
pub struct AddressChain {
    extractors: Vec<Box<dyn AddressExtractor>>,
}

impl AddressChain {
    pub fn new(extractors: Vec<Box<dyn AddressExtractor>>) -> Self {
        Self { extractors }
    }

    /// Returns the address and the strategy that produced it
    pub fn extract(&self, text: &str) -> Option<(String, &'static str)> {
        self.extractors
            .iter()
            .find_map(|e| e.extract(text).map(|address| (address, e.name())))
    }
}

impl Default for AddressChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(DirectField::new(&["use_address", "manual_ip"])),
            Box::new(NestedBlockField::new("manual_ip", "static_ip")),
            Box::new(SubstitutionField),
        ])
    }
}

// =============================== LINE HELPERS ================================== //

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn strip_comment(value: &str) -> &str {
    match value.find(" #") {
        Some(pos) => &value[..pos],
        None if value.trim_start().starts_with('#') => "",
        None => value,
    }
}

/// `key: rest` with the rest untouched (may be empty or a flow mapping)
fn split_key_value_raw(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start().trim_start_matches("- ");
    if trimmed.starts_with('#') {
        return None;
    }
    let (key, rest) = trimmed.split_once(':')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, rest))
}

/// `key: value` where value is a non-empty scalar
fn split_key_value(line: &str) -> Option<(&str, &str)> {
    let (key, rest) = split_key_value_raw(line)?;
    let value = strip_comment(rest).trim();
    if value.is_empty() {
        return None;
    }
    Some((key, value))
}

/// Lines belonging to a block that starts right before `following`
pub(crate) fn block_body<'a>(following: &[&'a str], block_indent: usize) -> Vec<&'a str> {
    let mut body = Vec::new();
    for line in following {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= block_indent {
            break;
        }
        body.push(*line);
    }
    body
}

/// Unquote and validate a scalar as a network host.
///
/// Substitution references, YAML tags and collections are rejected so a
/// later strategy can resolve them.
fn clean_host(raw: &str) -> Option<String> {
    let value = strip_comment(raw).trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
        .trim();

    if value.is_empty() || value.contains('$') || value.starts_with('!') {
        return None;
    }
    if value.parse::<IpAddr>().is_ok() || HOST_RE.is_match(value) {
        Some(value.to_string())
    } else {
        None
    }
}

/// Key/value pairs of the top-level `substitutions:` block
pub(crate) fn substitutions(text: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = text.lines().collect();
    let Some(start) = lines
        .iter()
        .position(|l| indent_of(l) == 0 && l.trim_end().starts_with("substitutions:"))
    else {
        return Vec::new();
    };

    block_body(&lines[start + 1..], 0)
        .into_iter()
        .filter_map(|line| {
            let (key, value) = split_key_value(line)?;
            let value = value.trim_matches(|c| c == '"' || c == '\'');
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
