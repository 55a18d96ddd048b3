use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Canonical lowercase wire/database representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($name), ": {}"), other
                    )),
                }
            }
        }
    };
}

str_enum! {
    /// Lifecycle of one submitted spreadsheet.
    UploadStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        CompletedWithErrors => "completed_with_errors",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

str_enum! {
    /// The four pipeline phases an upload moves through.
    Phase {
        Validation => "validation",
        Vop => "vop",
        Billing => "billing",
        Reconciliation => "reconciliation",
    }
}

str_enum! {
    /// Per-phase progress marker on an upload.
    PhaseStatus {
        Idle => "idle",
        Started => "started",
        Completed => "completed",
        Failed => "failed",
    }
}

str_enum! {
    /// Outcome of the structural/semantic row checks.
    ValidationStatus {
        Pending => "pending",
        Valid => "valid",
        Invalid => "invalid",
    }
}

str_enum! {
    /// Debtor lifecycle state.
    DebtorStatus {
        Uploaded => "uploaded",
        Pending => "pending",
        Approved => "approved",
        Failed => "failed",
        Recovered => "recovered",
    }
}

str_enum! {
    /// Billing-attempt lifecycle state, mapped 1:1 from the gateway.
    AttemptStatus {
        Pending => "pending",
        Approved => "approved",
        Declined => "declined",
        Error => "error",
        Voided => "voided",
        Chargebacked => "chargebacked",
    }
}

str_enum! {
    /// Which billing profile governs an IBAN.
    BillingModel {
        Legacy => "legacy",
        Flywheel => "flywheel",
        Recovery => "recovery",
    }
}

str_enum! {
    /// VOP readiness bucket derived from the 0-100 score.
    VopResult {
        Verified => "verified",
        LikelyVerified => "likely_verified",
        Inconclusive => "inconclusive",
        Mismatch => "mismatch",
        Rejected => "rejected",
    }
}

str_enum! {
    /// Raw BAV name-match outcome.
    NameMatch {
        Yes => "yes",
        Partial => "partial",
        No => "no",
        Unavailable => "unavailable",
    }
}

str_enum! {
    /// Which path discovered a chargeback.
    ChargebackSource {
        Webhook => "webhook",
        ApiSync => "api_sync",
    }
}

impl UploadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedWithErrors | Self::Failed | Self::Cancelled
        )
    }
}

impl PhaseStatus {
    /// A phase can be (re)started from idle or from a terminal state;
    /// a second start while `Started` is rejected by the unique job lock.
    pub fn can_start(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

impl DebtorStatus {
    /// Whether `self -> to` is a legal lifecycle transition.
    ///
    /// Webhook and reconciler updates re-check this under the row they
    /// loaded; an illegal transition is treated as a no-op, not an error.
    pub fn may_transition(&self, to: DebtorStatus) -> bool {
        use DebtorStatus::*;
        match (*self, to) {
            // Billing posts the first attempt.
            (Uploaded, Pending) | (Uploaded, Approved) | (Uploaded, Failed) => true,
            // Gateway settles an async attempt.
            (Pending, Approved) | (Pending, Failed) | (Pending, Recovered) => true,
            // Success handler promotes; chargeback demotes.
            (Approved, Recovered) | (Approved, Failed) => true,
            (Recovered, Failed) => true,
            // Re-billing a previously failed IBAN is a fresh debtor row,
            // never a transition on the old one.
            (Failed, _) => false,
            (state, to) => state == to,
        }
    }
}

impl AttemptStatus {
    /// Terminal states accept no further gateway-driven updates, with the
    /// single exception of `Approved -> Chargebacked`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether `self -> to` is a legal attempt transition.
    pub fn may_transition(&self, to: AttemptStatus) -> bool {
        use AttemptStatus::*;
        match (*self, to) {
            (Pending, Approved)
            | (Pending, Declined)
            | (Pending, Error)
            | (Pending, Voided)
            | (Pending, Chargebacked) => true,
            (Approved, Chargebacked) => true,
            (state, to) => state == to,
        }
    }
}

impl BillingModel {
    /// Flywheel and recovery share the profile/cycle machinery; legacy
    /// debtors bill their row amount with no cycle lock.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Flywheel | Self::Recovery)
    }

    /// The other non-legacy model, used by exclusivity checks.
    pub fn counterpart(&self) -> Option<BillingModel> {
        match self {
            Self::Flywheel => Some(Self::Recovery),
            Self::Recovery => Some(Self::Flywheel),
            Self::Legacy => None,
        }
    }
}

impl VopResult {
    /// Bucket a 0-100 score. Monotonic: a higher score never yields a
    /// weaker bucket.
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Self::Verified,
            60..=79 => Self::LikelyVerified,
            40..=59 => Self::Inconclusive,
            20..=39 => Self::Mismatch,
            _ => Self::Rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            AttemptStatus::Pending,
            AttemptStatus::Approved,
            AttemptStatus::Declined,
            AttemptStatus::Error,
            AttemptStatus::Voided,
            AttemptStatus::Chargebacked,
        ] {
            assert_eq!(status.as_str().parse::<AttemptStatus>().unwrap(), status);
        }
        assert!("garbage".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn attempt_transitions_match_lifecycle() {
        use AttemptStatus::*;
        assert!(Pending.may_transition(Approved));
        assert!(Pending.may_transition(Voided));
        assert!(Approved.may_transition(Chargebacked));
        assert!(!Declined.may_transition(Approved));
        assert!(!Chargebacked.may_transition(Pending));
        // Idempotent replays are always legal.
        assert!(Chargebacked.may_transition(Chargebacked));
    }

    #[test]
    fn debtor_failed_is_a_dead_end() {
        use DebtorStatus::*;
        for to in [Uploaded, Pending, Approved, Recovered] {
            assert!(!Failed.may_transition(to));
        }
        assert!(Failed.may_transition(Failed));
    }

    #[test]
    fn vop_buckets_are_monotonic() {
        let mut last = VopResult::Rejected;
        for score in 0..=100u8 {
            let bucket = VopResult::from_score(score);
            let rank = |r: VopResult| match r {
                VopResult::Rejected => 0,
                VopResult::Mismatch => 1,
                VopResult::Inconclusive => 2,
                VopResult::LikelyVerified => 3,
                VopResult::Verified => 4,
            };
            assert!(rank(bucket) >= rank(last), "score {score} weakened bucket");
            last = bucket;
        }
        assert_eq!(VopResult::from_score(80), VopResult::Verified);
        assert_eq!(VopResult::from_score(79), VopResult::LikelyVerified);
        assert_eq!(VopResult::from_score(19), VopResult::Rejected);
    }
}
