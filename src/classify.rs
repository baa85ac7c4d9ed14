//! Classification of raw list lines into typed entries.
//!
//! Pure functions only: no I/O happens here. A line is either discarded
//! (blank, comment, malformed) or becomes exactly one [`Entry`].

use ipnet::IpNet;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::debug;

/// Default comment marker for list files.
pub const DEFAULT_COMMENT_MARKER: &str = "#";

const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Kind of a classified entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Domain,
    Ipv4,
    Ipv6,
}

/// A classified list entry.
///
/// IP entries always carry a prefix (full length when the source line had
/// none) and are stored truncated to their network address, so
/// `10.0.0.1/8` and `10.0.0.0/8` are the same entry. Domains are lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entry {
    Domain(String),
    Ip(IpNet),
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        match self {
            Entry::Domain(_) => EntryKind::Domain,
            Entry::Ip(IpNet::V4(_)) => EntryKind::Ipv4,
            Entry::Ip(IpNet::V6(_)) => EntryKind::Ipv6,
        }
    }

    pub fn prefix_len(&self) -> Option<u8> {
        match self {
            Entry::Domain(_) => None,
            Entry::Ip(net) => Some(net.prefix_len()),
        }
    }

    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Entry::Domain(d) => Some(d),
            Entry::Ip(_) => None,
        }
    }

    pub fn as_net(&self) -> Option<&IpNet> {
        match self {
            Entry::Ip(net) => Some(net),
            Entry::Domain(_) => None,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Domain(d) => f.write_str(d),
            Entry::Ip(net) => write!(f, "{}", net),
        }
    }
}

impl FromStr for Entry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        classify_token(s).ok_or_else(|| format!("not an IP, CIDR or domain: {}", s))
    }
}

/// Outcome of classifying a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineOutcome {
    /// Blank line or comment.
    Ignored,
    /// Line did not classify; carries the offending text.
    Invalid(String),
    Entry(Entry),
}

/// Classify one line of list content.
pub fn classify_line(line: &str, comment_marker: &str) -> LineOutcome {
    let trimmed = line.trim();
    if trimmed.is_empty() || (!comment_marker.is_empty() && trimmed.starts_with(comment_marker)) {
        return LineOutcome::Ignored;
    }
    match classify_token(trimmed) {
        Some(entry) => LineOutcome::Entry(entry),
        None => LineOutcome::Invalid(trimmed.to_string()),
    }
}

/// Classify a single token (no surrounding whitespace expected).
fn classify_token(token: &str) -> Option<Entry> {
    if let Some(net) = parse_ip_or_cidr(token) {
        return Some(Entry::Ip(net.trunc()));
    }
    let domain = token.strip_suffix('.').unwrap_or(token);
    if is_valid_domain(domain) {
        return Some(Entry::Domain(domain.to_ascii_lowercase()));
    }
    None
}

/// Parse an IP literal or CIDR, defaulting the prefix to full length.
pub fn parse_ip_or_cidr(token: &str) -> Option<IpNet> {
    if token.contains('/') {
        token.parse::<IpNet>().ok()
    } else {
        token.parse::<IpAddr>().ok().map(IpNet::from)
    }
}

/// Check a domain name against the hostname grammar.
///
/// Labels are ASCII alphanumerics and hyphens, 1-63 characters, without a
/// leading or trailing hyphen. The last label may not be all digits, which
/// keeps malformed IPv4 literals such as `1.2.3` out of the domain class.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return false;
    }

    let mut last_label = "";
    for label in domain.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
        last_label = label;
    }

    !last_label.chars().all(|c| c.is_ascii_digit())
}

/// Entries parsed from one list source, deduplicated, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedList {
    pub entries: Vec<Entry>,
    /// Lines that were neither blank, comments, nor valid entries.
    pub invalid_lines: usize,
}

impl ParsedList {
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(Entry::as_domain)
    }

    pub fn networks(&self) -> impl Iterator<Item = &IpNet> {
        self.entries.iter().filter_map(Entry::as_net)
    }

    pub fn count(&self, kind: EntryKind) -> usize {
        self.entries.iter().filter(|e| e.kind() == kind).count()
    }

    /// Merge another list into this one, keeping entries unique.
    pub fn extend_unique(&mut self, other: &ParsedList) {
        let mut seen: HashSet<&Entry> = self.entries.iter().collect();
        let mut added = Vec::new();
        for entry in &other.entries {
            if seen.insert(entry) {
                added.push(entry.clone());
            }
        }
        self.entries.extend(added);
        self.invalid_lines += other.invalid_lines;
    }
}

/// Parse list content line by line.
///
/// Malformed lines are skipped with a debug diagnostic; they never fail the
/// whole list.
pub fn parse_entries(content: &str, comment_marker: &str) -> ParsedList {
    parse_lines(content.lines(), comment_marker)
}

/// Parse an already split sequence of lines (inline lists).
pub fn parse_lines<'a, I>(lines: I, comment_marker: &str) -> ParsedList
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen: HashSet<Entry> = HashSet::new();
    let mut parsed = ParsedList::default();

    for line in lines {
        match classify_line(line, comment_marker) {
            LineOutcome::Ignored => {}
            LineOutcome::Invalid(text) => {
                debug!("Skipping unparseable list line: {:?}", text);
                parsed.invalid_lines += 1;
            }
            LineOutcome::Entry(entry) => {
                if !seen.contains(&entry) {
                    seen.insert(entry.clone());
                    parsed.entries.push(entry);
                }
            }
        }
    }

    parsed
}
