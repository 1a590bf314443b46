//! Delivery artifacts and per-strategy version ordering.

use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Deb,
    Docker,
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deb => f.write_str("deb"),
            Self::Docker => f.write_str("docker"),
        }
    }
}

/// An artifact tracked by a delivery config, identified by
/// `(name, type, reference)`. The `reference` is how environments and
/// constraint state refer back to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeliveryArtifact {
    pub name: String,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub reference: String,
    #[serde(default)]
    pub versioning: VersioningStrategy,
}

/// Versions are not generically orderable; each strategy defines its own
/// total order. Greater means newer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VersioningStrategy {
    #[default]
    Semver,
    /// Docker tags carrying an embedded semver, e.g. `release-1.2.3`.
    SemverTag,
    /// Docker tags carrying a monotonically increasing number, e.g. build ids.
    IncreasingTag,
    Debian,
    Timestamp,
}

impl VersioningStrategy {
    pub fn compare(self, a: &str, b: &str) -> Ordering {
        match self {
            Self::Semver => cmp_optional(parse_semver(a), parse_semver(b)),
            Self::SemverTag => cmp_optional(capture_semver(a), capture_semver(b)),
            Self::IncreasingTag => cmp_optional(capture_number(a), capture_number(b)),
            Self::Debian => debian_cmp(a, b),
            Self::Timestamp => timestamp_cmp(a, b),
        }
    }

    pub fn sort_newest_first(self, versions: &mut [String]) {
        versions.sort_by(|a, b| self.compare(b, a));
    }
}

// Unparseable versions sort older than anything parseable.
fn cmp_optional<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn parse_semver(input: &str) -> Option<Version> {
    Version::parse(input.strip_prefix('v').unwrap_or(input)).ok()
}

fn capture_semver(input: &str) -> Option<Version> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?)").unwrap()
    });
    re.captures(input)
        .and_then(|c| c.get(1))
        .and_then(|m| Version::parse(m.as_str()).ok())
}

fn capture_number(input: &str) -> Option<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(\d+)").unwrap());
    re.captures(input)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

// Timestamp versions compare by their digit content. The shorter digit
// string is right-padded with zeros so a date-only version lines up with a
// finer-precision one at the start of that instant.
fn timestamp_cmp(a: &str, b: &str) -> Ordering {
    match (version_digits(a), version_digits(b)) {
        (Some(mut da), Some(mut db)) => {
            let width = da.len().max(db.len());
            pad_digits(&mut da, width);
            pad_digits(&mut db, width);
            da.cmp(&db)
        }
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn version_digits(input: &str) -> Option<String> {
    let digits: String = input.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn pad_digits(digits: &mut String, width: usize) {
    while digits.len() < width {
        digits.push('0');
    }
}

// Debian policy ordering: `[epoch:]upstream[-revision]`, components compared
// with the dpkg algorithm where `~` sorts before everything including the
// empty string.
fn debian_cmp(a: &str, b: &str) -> Ordering {
    let (ea, ua, ra) = split_debian(a);
    let (eb, ub, rb) = split_debian(b);
    ea.cmp(&eb)
        .then_with(|| dpkg_cmp(ua, ub))
        .then_with(|| dpkg_cmp(ra, rb))
}

fn split_debian(v: &str) -> (u64, &str, &str) {
    let (epoch, rest) = match v.split_once(':') {
        Some((e, r)) if !e.is_empty() && e.bytes().all(|b| b.is_ascii_digit()) => {
            (e.parse().unwrap_or(0), r)
        }
        _ => (0, v),
    };
    match rest.rsplit_once('-') {
        Some((upstream, revision)) => (epoch, upstream, revision),
        None => (epoch, rest, ""),
    }
}

fn dpkg_order(c: u8) -> i32 {
    match c {
        b'~' => -1,
        b'0'..=b'9' => 0,
        b'A'..=b'Z' | b'a'..=b'z' => i32::from(c),
        _ => i32::from(c) + 256,
    }
}

fn dpkg_cmp(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() || j < b.len() {
        // non-digit span
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let oa = if i < a.len() { dpkg_order(a[i]) } else { 0 };
            let ob = if j < b.len() { dpkg_order(b[j]) } else { 0 };
            if oa != ob {
                return oa.cmp(&ob);
            }
            i += 1;
            j += 1;
        }
        // digit span: skip leading zeros, longer run wins, else first diff
        while i < a.len() && a[i] == b'0' {
            i += 1;
        }
        while j < b.len() && b[j] == b'0' {
            j += 1;
        }
        let mut first_diff = Ordering::Equal;
        while i < a.len() && a[i].is_ascii_digit() && j < b.len() && b[j].is_ascii_digit() {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if i < a.len() && a[i].is_ascii_digit() {
            return Ordering::Greater;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }
    Ordering::Equal
}
