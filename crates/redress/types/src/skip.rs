use crate::status::AttemptStatus;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Why an incoming row was excluded from the pipeline.
///
/// Ordering of the variants mirrors the priority order of the
/// deduplication rules: the first matching reason wins and classification
/// stops, so at most one reason is ever attached to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// IBAN hash is on the blacklist.
    Blacklisted,
    /// IBAN was chargebacked on any prior attempt.
    Chargebacked,
    /// IBAN already has a recovered debtor outside the current upload.
    AlreadyRecovered,
    /// IBAN has an in-flight attempt inside the cooldown window.
    RecentlyAttempted,
    /// first|last name matches a blacklist entry.
    BlacklistedName,
    /// Email matches a blacklist entry.
    BlacklistedEmail,
    /// Non-legacy row against an existing legacy profile.
    ExistingLegacyIban,
    /// Row model conflicts with the profile's established model.
    ModelConflict,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blacklisted => "blacklisted",
            Self::Chargebacked => "chargebacked",
            Self::AlreadyRecovered => "already_recovered",
            Self::RecentlyAttempted => "recently_attempted",
            Self::BlacklistedName => "blacklisted_name",
            Self::BlacklistedEmail => "blacklisted_email",
            Self::ExistingLegacyIban => "existing_legacy_iban",
            Self::ModelConflict => "model_conflict",
        }
    }

    /// Permanent reasons never expire; the rest are cooldowns or
    /// model-state conditions that a later upload may not hit.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Blacklisted | Self::Chargebacked | Self::AlreadyRecovered
        )
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SkipReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blacklisted" => Ok(Self::Blacklisted),
            "chargebacked" => Ok(Self::Chargebacked),
            "already_recovered" => Ok(Self::AlreadyRecovered),
            "recently_attempted" => Ok(Self::RecentlyAttempted),
            "blacklisted_name" => Ok(Self::BlacklistedName),
            "blacklisted_email" => Ok(Self::BlacklistedEmail),
            "existing_legacy_iban" => Ok(Self::ExistingLegacyIban),
            "model_conflict" => Ok(Self::ModelConflict),
            other => Err(format!("unknown skip reason: {other}")),
        }
    }
}

/// Classification attached to a skipped row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipClassification {
    pub reason: SkipReason,
    pub permanent: bool,
    /// Age of the blocking attempt, for cooldown reasons.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_ago: Option<i64>,
    /// Status of the blocking attempt, for cooldown reasons.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<AttemptStatus>,
}

impl SkipClassification {
    pub fn new(reason: SkipReason) -> Self {
        Self {
            reason,
            permanent: reason.is_permanent(),
            days_ago: None,
            last_status: None,
        }
    }

    pub fn recently_attempted(days_ago: i64, last_status: AttemptStatus) -> Self {
        Self {
            reason: SkipReason::RecentlyAttempted,
            permanent: false,
            days_ago: Some(days_ago),
            last_status: Some(last_status),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permanence_follows_reason() {
        assert!(SkipClassification::new(SkipReason::Blacklisted).permanent);
        assert!(SkipClassification::new(SkipReason::Chargebacked).permanent);
        assert!(!SkipClassification::new(SkipReason::ModelConflict).permanent);
        let skip = SkipClassification::recently_attempted(10, AttemptStatus::Pending);
        assert!(!skip.permanent);
        assert_eq!(skip.days_ago, Some(10));
    }
}
