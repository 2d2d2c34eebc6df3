//! Security policy attached to a token
//!
//! A policy narrows what an actor may touch along three dimensions (node ids,
//! source ids and aggregation levels) and may carry an expiry. An empty
//! dimension imposes no restriction.

use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Aggregation level of a datum stream, the `aggregation` topic segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Aggregation {
    None,
    Average,
    Minute,
    FiveMinute,
    TenMinute,
    FifteenMinute,
    ThirtyMinute,
    Hour,
    Day,
    Week,
    Month,
    Year,
    RunningTotal,
}

impl Aggregation {
    const ALL: [Aggregation; 13] = [
        Self::None,
        Self::Average,
        Self::Minute,
        Self::FiveMinute,
        Self::TenMinute,
        Self::FifteenMinute,
        Self::ThirtyMinute,
        Self::Hour,
        Self::Day,
        Self::Week,
        Self::Month,
        Self::Year,
        Self::RunningTotal,
    ];

    /// Short topic key
    pub fn key(self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Average => "avg",
            Self::Minute => "m",
            Self::FiveMinute => "5m",
            Self::TenMinute => "10m",
            Self::FifteenMinute => "15m",
            Self::ThirtyMinute => "30m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "w",
            Self::Month => "M",
            Self::Year => "Y",
            Self::RunningTotal => "RT",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Average => "Average",
            Self::Minute => "Minute",
            Self::FiveMinute => "FiveMinute",
            Self::TenMinute => "TenMinute",
            Self::FifteenMinute => "FifteenMinute",
            Self::ThirtyMinute => "ThirtyMinute",
            Self::Hour => "Hour",
            Self::Day => "Day",
            Self::Week => "Week",
            Self::Month => "Month",
            Self::Year => "Year",
            Self::RunningTotal => "RunningTotal",
        }
    }
}

impl FromStr for Aggregation {
    type Err = String;

    /// Keys are matched exactly (`m` and `M` differ), names case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|a| a.key() == s)
            .or_else(|| Self::ALL.iter().find(|a| a.name().eq_ignore_ascii_case(s)))
            .copied()
            .ok_or_else(|| format!("unknown aggregation: {}", s))
    }
}

impl TryFrom<String> for Aggregation {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Aggregation> for String {
    fn from(agg: Aggregation) -> Self {
        agg.name().to_string()
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability restriction carried by a token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityPolicy {
    pub node_ids: BTreeSet<i64>,
    pub source_ids: BTreeSet<String>,
    pub aggregations: BTreeSet<Aggregation>,
    #[serde(
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub not_after: Option<DateTime<Utc>>,
}

impl SecurityPolicy {
    /// Parse the policy JSON stored with a token
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Whether the policy has not yet expired at `now`
    pub fn valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after.map_or(true, |not_after| not_after > now)
    }

    pub fn restricts_nodes(&self) -> bool {
        !self.node_ids.is_empty()
    }

    pub fn restricts_sources(&self) -> bool {
        !self.source_ids.is_empty()
    }

    pub fn restricts_aggregations(&self) -> bool {
        !self.aggregations.is_empty()
    }
}

/// Source id patterns compiled for path-style matching
///
/// `*` matches within one path level and `**` across levels, including none,
/// so `power/**` also matches `power`. A leading `/` on either side is not
/// significant. Patterns that fail to compile as globs are
/// matched literally.
#[derive(Debug, Clone, Default)]
pub struct SourcePatterns {
    literals: HashSet<String>,
    globs: Option<GlobSet>,
}

impl SourcePatterns {
    pub fn compile<'a>(patterns: impl IntoIterator<Item = &'a String>) -> Self {
        let mut literals = HashSet::new();
        let mut builder = GlobSetBuilder::new();
        let mut glob_count = 0;

        for pattern in patterns {
            let pattern = normalize_source_path(pattern);
            // globset needs at least one level after a trailing `/**`
            let parent = pattern.strip_suffix("/**").filter(|p| !p.is_empty());
            for pattern in std::iter::once(pattern).chain(parent) {
                literals.insert(pattern.to_string());
                match GlobBuilder::new(pattern).literal_separator(true).build() {
                    Ok(glob) => {
                        builder.add(glob);
                        glob_count += 1;
                    }
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "Source pattern is not a valid glob, matching literally");
                    }
                }
            }
        }

        let globs = if glob_count > 0 {
            match builder.build() {
                Ok(set) => Some(set),
                Err(e) => {
                    warn!(error = %e, "Failed to build source pattern set");
                    None
                }
            }
        } else {
            None
        };

        Self { literals, globs }
    }

    /// Whether `path` matches any pattern
    pub fn matches(&self, path: &str) -> bool {
        let path = normalize_source_path(path);
        self.literals.contains(path)
            || self.globs.as_ref().map_or(false, |set| set.is_match(path))
    }
}

fn normalize_source_path(path: &str) -> &str {
    path.trim_start_matches('/')
}
