use redress_types::NameMatch;

/// Weighted inputs of the VOP score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VopInputs {
    pub iban_valid: bool,
    pub country_in_sepa: bool,
    /// A bank directory lookup succeeded and returned a bank name.
    pub bank_identified: bool,
    /// The bank record carries the SEPA-direct-debit capability flag.
    pub sdd_supported: bool,
    pub name_match: NameMatch,
}

const POINTS_IBAN_VALID: u8 = 20;
const POINTS_COUNTRY_SEPA: u8 = 15;
const POINTS_BANK_IDENTIFIED: u8 = 25;
const POINTS_SDD_SUPPORTED: u8 = 25;
const POINTS_NAME_MATCH_YES: u8 = 15;
const POINTS_NAME_MATCH_PARTIAL: u8 = 10;

/// Deterministic 0-100 score; the bucket comes from
/// [`redress_types::VopResult::from_score`].
pub fn score(inputs: &VopInputs) -> u8 {
    let mut total = 0u8;
    if inputs.iban_valid {
        total += POINTS_IBAN_VALID;
    }
    if inputs.country_in_sepa {
        total += POINTS_COUNTRY_SEPA;
    }
    if inputs.bank_identified {
        total += POINTS_BANK_IDENTIFIED;
    }
    if inputs.sdd_supported {
        total += POINTS_SDD_SUPPORTED;
    }
    total += match inputs.name_match {
        NameMatch::Yes => POINTS_NAME_MATCH_YES,
        NameMatch::Partial => POINTS_NAME_MATCH_PARTIAL,
        NameMatch::No | NameMatch::Unavailable => 0,
    };
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use redress_types::VopResult;

    fn inputs(name_match: NameMatch) -> VopInputs {
        VopInputs {
            iban_valid: true,
            country_in_sepa: true,
            bank_identified: true,
            sdd_supported: true,
            name_match,
        }
    }

    #[test]
    fn full_marks_is_one_hundred() {
        assert_eq!(score(&inputs(NameMatch::Yes)), 100);
        assert_eq!(
            VopResult::from_score(score(&inputs(NameMatch::Yes))),
            VopResult::Verified
        );
    }

    #[test]
    fn partial_and_missing_name_match() {
        assert_eq!(score(&inputs(NameMatch::Partial)), 95);
        assert_eq!(score(&inputs(NameMatch::Unavailable)), 85);
        assert_eq!(score(&inputs(NameMatch::No)), 85);
    }

    #[test]
    fn score_is_deterministic_and_bounded() {
        for iban_valid in [false, true] {
            for country in [false, true] {
                for bank in [false, true] {
                    for sdd in [false, true] {
                        for nm in [
                            NameMatch::Yes,
                            NameMatch::Partial,
                            NameMatch::No,
                            NameMatch::Unavailable,
                        ] {
                            let i = VopInputs {
                                iban_valid,
                                country_in_sepa: country,
                                bank_identified: bank,
                                sdd_supported: sdd,
                                name_match: nm,
                            };
                            let first = score(&i);
                            assert_eq!(first, score(&i));
                            assert!(first <= 100);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn nothing_scores_zero() {
        let i = VopInputs {
            iban_valid: false,
            country_in_sepa: false,
            bank_identified: false,
            sdd_supported: false,
            name_match: NameMatch::Unavailable,
        };
        assert_eq!(score(&i), 0);
        assert_eq!(VopResult::from_score(0), VopResult::Rejected);
    }
}
