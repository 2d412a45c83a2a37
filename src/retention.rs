//! Retention policies for backup repositories.
//!
//! A [`RetentionPolicy`] is an ordered list of `(interval, keep)` rules. The
//! pruning plan follows Borg's `prune` semantics so a policy written for the
//! old `BORG_PRUNE_POLICY` string keeps the same archives:
//!
//! - archives are walked newest first;
//! - each rule keeps the newest archive of every period it has not seen yet,
//!   skipping archives an earlier rule already kept, until `keep` are kept;
//! - the result is a pure function of the archive list, the policy and `now`.
//!
//! Two guarantees are layered on top: archives dated after `now` are never
//! removed, and the newest archive is always kept, even for an empty policy
//! or one made only of `keep 0` rules.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::types::Archive;

/// Period granularity of a retention rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Interval {
    /// Every archive is its own period (`--keep-last`)
    Last,
    Minutely,
    Hourly,
    Daily,
    /// ISO-8601 weeks
    Weekly,
    Monthly,
    Yearly,
}

impl Interval {
    /// Key identifying the period an archive falls into
    fn period_key(self, archive: &Archive) -> String {
        let pattern = match self {
            Interval::Last => return archive.name.clone(),
            Interval::Minutely => "%Y-%m-%d %H:%M",
            Interval::Hourly => "%Y-%m-%d %H",
            Interval::Daily => "%Y-%m-%d",
            Interval::Weekly => "%G-W%V",
            Interval::Monthly => "%Y-%m",
            Interval::Yearly => "%Y",
        };
        archive.time.format(pattern).to_string()
    }
}

/// Keep `keep` archives, one per `interval`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub interval: Interval,
    pub keep: u32,
}

impl RetentionRule {
    pub const fn new(interval: Interval, keep: u32) -> Self {
        Self { interval, keep }
    }
}

/// Errors raised while building a policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetentionError {
    #[error("interval '{0}' appears more than once")]
    DuplicateInterval(Interval),

    #[error("unsupported prune option '{0}'")]
    UnsupportedOption(String),

    #[error("invalid keep count for '{option}': '{value}'")]
    InvalidCount { option: String, value: String },

    #[error("prune option '{0}' is missing its value")]
    MissingValue(String),
}

/// Which archives survive a prune
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneDecision {
    /// Kept archive names, newest first
    pub keep: Vec<String>,
    /// Removed archive names, newest first
    pub remove: Vec<String>,
}

/// Ordered rule set applied to one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetentionPolicy {
    rules: Vec<RetentionRule>,
}

impl Default for RetentionPolicy {
    /// 7 daily, 4 weekly, 12 monthly
    fn default() -> Self {
        Self {
            rules: vec![
                RetentionRule::new(Interval::Daily, 7),
                RetentionRule::new(Interval::Weekly, 4),
                RetentionRule::new(Interval::Monthly, 12),
            ],
        }
    }
}

impl RetentionPolicy {
    /// Build a policy, rejecting repeated intervals
    pub fn new(rules: Vec<RetentionRule>) -> Result<Self, RetentionError> {
        let policy = Self { rules };
        policy.validate()?;
        Ok(policy)
    }

    pub fn rules(&self) -> &[RetentionRule] {
        &self.rules
    }

    /// Check that no interval is listed twice
    pub fn validate(&self) -> Result<(), RetentionError> {
        for (i, rule) in self.rules.iter().enumerate() {
            if self.rules[..i].iter().any(|r| r.interval == rule.interval) {
                return Err(RetentionError::DuplicateInterval(rule.interval));
            }
        }
        Ok(())
    }

    /// Parse Borg-style prune options, e.g. `["--keep-daily=7", "--keep-weekly", "4"]`
    pub fn from_borg_args<S: AsRef<str>>(args: &[S]) -> Result<Self, RetentionError> {
        let mut rules = Vec::new();
        let mut iter = args.iter().map(|arg| -> &str { arg.as_ref() });

        while let Some(arg) = iter.next() {
            let (option, inline_value) = match arg.split_once('=') {
                Some((option, value)) => (option, Some(value)),
                None => (arg, None),
            };

            let interval = option
                .strip_prefix("--keep-")
                .and_then(|name| name.parse::<Interval>().ok())
                .ok_or_else(|| RetentionError::UnsupportedOption(option.to_string()))?;

            let value = match inline_value {
                Some(value) => value,
                None => iter
                    .next()
                    .ok_or_else(|| RetentionError::MissingValue(option.to_string()))?,
            };

            let keep = value.parse::<u32>().map_err(|_| RetentionError::InvalidCount {
                option: option.to_string(),
                value: value.to_string(),
            })?;

            rules.push(RetentionRule::new(interval, keep));
        }

        Self::new(rules)
    }

    /// Decide which archives to keep and which to remove
    pub fn plan(&self, archives: &[Archive], now: NaiveDateTime) -> PruneDecision {
        let mut sorted: Vec<&Archive> = archives.iter().collect();
        sorted.sort_by(|a, b| b.time.cmp(&a.time).then_with(|| b.name.cmp(&a.name)));

        let mut kept = vec![false; sorted.len()];

        for rule in &self.rules {
            if rule.keep == 0 {
                continue;
            }

            let mut last_period: Option<String> = None;
            let mut count = 0;

            for (index, archive) in sorted.iter().enumerate() {
                if archive.time > now {
                    continue;
                }

                let period = rule.interval.period_key(archive);
                if last_period.as_deref() == Some(period.as_str()) {
                    continue;
                }
                last_period = Some(period);

                if !kept[index] {
                    kept[index] = true;
                    count += 1;
                    if count == rule.keep {
                        break;
                    }
                }
            }
        }

        for (index, archive) in sorted.iter().enumerate() {
            if archive.time > now {
                kept[index] = true;
            }
        }

        // At least one recovery point always survives
        if let Some(newest) = kept.first_mut() {
            *newest = true;
        }

        let mut decision = PruneDecision::default();
        for (archive, keep) in sorted.into_iter().zip(kept) {
            if keep {
                decision.keep.push(archive.name.clone());
            } else {
                decision.remove.push(archive.name.clone());
            }
        }
        decision
    }
}
