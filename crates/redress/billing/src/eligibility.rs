use redress_types::{BillingConfig, Debtor, DebtorProfile, DebtorStatus};
use rust_decimal::Decimal;

/// Why a debtor cannot be billed right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillRefusal {
    /// Terminal debtor state.
    DebtorState(DebtorStatus),
    /// Amount outside the resolved model's range (legacy has no range).
    AmountOutOfRange,
    /// The profile has been deactivated (typically by a chargeback).
    ProfileInactive,
}

/// The `canBill` pre-check: amount within the resolved model range,
/// debtor not in a terminal state, profile active if present.
pub fn can_bill(
    debtor: &Debtor,
    amount: Decimal,
    config: &BillingConfig,
    profile: Option<&DebtorProfile>,
) -> Result<(), BillRefusal> {
    if matches!(debtor.status, DebtorStatus::Recovered | DebtorStatus::Failed) {
        return Err(BillRefusal::DebtorState(debtor.status));
    }
    if let Some(profile) = profile {
        if !profile.is_active {
            return Err(BillRefusal::ProfileInactive);
        }
        if let Some(range) = config.range(profile.billing_model) {
            if !range.contains(amount) {
                return Err(BillRefusal::AmountOutOfRange);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use redress_types::{BillingModel, ValidationStatus};
    use rust_decimal_macros::dec;

    fn debtor(status: DebtorStatus) -> Debtor {
        Debtor {
            id: 1,
            upload_id: 1,
            first_name: "Ada".into(),
            last_name: "Lovelace".into(),
            email: None,
            iban: "DE89370400440532013000".into(),
            iban_hash: "h".into(),
            iban_valid: true,
            country: Some("DE".into()),
            amount: dec!(7.00),
            currency: "EUR".into(),
            raw_row: serde_json::json!({}),
            validation_status: ValidationStatus::Valid,
            validation_errors: vec![],
            validated_at: None,
            status,
            skip_reason: None,
            selected_for_bav: false,
            profile_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn profile(model: BillingModel, active: bool) -> DebtorProfile {
        DebtorProfile {
            id: 9,
            iban_hash: "h".into(),
            iban_masked: "m".into(),
            billing_model: model,
            billing_amount: Some(dec!(7.00)),
            currency: "EUR".into(),
            is_active: active,
            last_success_at: None,
            last_billed_at: None,
            next_bill_at: None,
            lifetime_revenue: dec!(0),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn terminal_debtors_are_refused() {
        let config = BillingConfig::default();
        for status in [DebtorStatus::Recovered, DebtorStatus::Failed] {
            assert_eq!(
                can_bill(&debtor(status), dec!(7.00), &config, None),
                Err(BillRefusal::DebtorState(status))
            );
        }
        assert!(can_bill(&debtor(DebtorStatus::Uploaded), dec!(7.00), &config, None).is_ok());
    }

    #[test]
    fn inactive_profile_is_refused() {
        let config = BillingConfig::default();
        let p = profile(BillingModel::Flywheel, false);
        assert_eq!(
            can_bill(&debtor(DebtorStatus::Uploaded), dec!(7.00), &config, Some(&p)),
            Err(BillRefusal::ProfileInactive)
        );
    }

    #[test]
    fn amount_must_fit_the_profile_model() {
        let config = BillingConfig::default();
        let p = profile(BillingModel::Flywheel, true);
        assert!(can_bill(&debtor(DebtorStatus::Uploaded), dec!(7.00), &config, Some(&p)).is_ok());
        assert_eq!(
            can_bill(&debtor(DebtorStatus::Uploaded), dec!(25.00), &config, Some(&p)),
            Err(BillRefusal::AmountOutOfRange)
        );
        // Legacy profiles bill the row amount without a range.
        let legacy = profile(BillingModel::Legacy, true);
        assert!(
            can_bill(&debtor(DebtorStatus::Uploaded), dec!(480.00), &config, Some(&legacy)).is_ok()
        );
    }
}
