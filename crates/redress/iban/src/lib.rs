//! IBAN utilities: normalization, ISO-13616 checksum validation, SHA-256
//! hashing, masking, and country/bank-code extraction.
//!
//! Everything here is pure and deterministic; the hash of a normalized IBAN
//! is the cross-upload identity of an account and must never change.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

use sha2::{Digest, Sha256};

/// SEPA member country codes (closed set).
pub const SEPA_COUNTRIES: &[&str] = &[
    "AD", "AT", "BE", "BG", "CH", "CY", "CZ", "DE", "DK", "EE", "ES", "FI", "FR", "GB", "GI",
    "GR", "HR", "HU", "IE", "IS", "IT", "LI", "LT", "LU", "LV", "MC", "MT", "NL", "NO", "PL",
    "PT", "RO", "SE", "SI", "SK", "SM", "VA",
];

/// Bank-code position inside the BBAN, per country: (code, start, len)
/// offsets into the normalized IBAN. Countries not listed expose no bank
/// code and fall back to the remote directory lookup only.
const BANK_CODE_SLICES: &[(&str, usize, usize)] = &[
    ("AT", 4, 5),
    ("BE", 4, 3),
    ("CH", 4, 5),
    ("CY", 4, 3),
    ("CZ", 4, 4),
    ("DE", 4, 8),
    ("DK", 4, 4),
    ("EE", 4, 2),
    ("ES", 4, 4),
    ("FI", 4, 3),
    ("FR", 4, 5),
    ("GB", 4, 4),
    ("GR", 4, 3),
    ("HR", 4, 7),
    ("HU", 4, 3),
    ("IE", 4, 4),
    // Italian IBANs carry a leading CIN letter before the ABI bank code.
    ("IT", 5, 5),
    ("LT", 4, 5),
    ("LU", 4, 3),
    ("LV", 4, 4),
    ("MC", 4, 5),
    ("MT", 4, 4),
    ("NL", 4, 4),
    ("NO", 4, 4),
    ("PL", 4, 8),
    ("PT", 4, 4),
    ("RO", 4, 4),
    ("SE", 4, 3),
    ("SI", 4, 5),
    ("SK", 4, 4),
];

/// Uppercase and strip every non-alphanumeric character.
///
/// Idempotent: `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Structural + checksum validation of a normalized IBAN.
///
/// `true` guarantees: two leading uppercase ASCII letters, two check
/// digits, total length in [15, 34], alphanumeric body, and mod-97
/// remainder 1.
pub fn is_valid(normalized: &str) -> bool {
    let bytes = normalized.as_bytes();
    if !(15..=34).contains(&bytes.len()) {
        return false;
    }
    if !(bytes[0].is_ascii_uppercase() && bytes[1].is_ascii_uppercase()) {
        return false;
    }
    if !(bytes[2].is_ascii_digit() && bytes[3].is_ascii_digit()) {
        return false;
    }
    if !bytes.iter().all(|b| b.is_ascii_alphanumeric()) {
        return false;
    }
    mod97(normalized) == 1
}

/// ISO-7064 mod-97 over the rearranged IBAN (body + country + check).
fn mod97(normalized: &str) -> u32 {
    let rearranged = normalized
        .bytes()
        .skip(4)
        .chain(normalized.bytes().take(4));
    let mut rem: u32 = 0;
    for b in rearranged {
        let value = if b.is_ascii_digit() {
            (b - b'0') as u32
        } else {
            // 'A' -> 10 ... 'Z' -> 35, two digits at once.
            (b - b'A') as u32 + 10
        };
        rem = if value < 10 {
            (rem * 10 + value) % 97
        } else {
            (rem * 100 + value) % 97
        };
    }
    rem
}

/// SHA-256 of the normalized IBAN, lowercase hex (64 chars / 32 bytes).
pub fn hash(normalized: &str) -> String {
    let digest = Sha256::digest(normalized.as_bytes());
    hex::encode(digest)
}

/// Convenience: normalize then hash in one step.
pub fn hash_raw(raw: &str) -> String {
    hash(&normalize(raw))
}

/// Mask all but the leading country+check block and the last four
/// characters: `DE89370400440532013000` -> `DE89**************3000`.
pub fn mask(normalized: &str) -> String {
    let n = normalized.chars().count();
    if n <= 8 {
        return "*".repeat(n);
    }
    let head: String = normalized.chars().take(4).collect();
    let tail: String = normalized.chars().skip(n - 4).collect();
    format!("{head}{}{tail}", "*".repeat(n - 8))
}

/// Two-letter country code, if the prefix looks like one.
pub fn country(normalized: &str) -> Option<&str> {
    let prefix = normalized.get(0..2)?;
    prefix
        .bytes()
        .all(|b| b.is_ascii_uppercase())
        .then_some(prefix)
}

/// Whether the IBAN's country participates in SEPA.
pub fn is_sepa(country_code: &str) -> bool {
    SEPA_COUNTRIES.contains(&country_code)
}

/// National bank code extracted by the per-country slice table.
pub fn bank_code(normalized: &str) -> Option<&str> {
    let cc = country(normalized)?;
    let (_, start, len) = BANK_CODE_SLICES.iter().find(|(c, _, _)| *c == cc)?;
    normalized.get(*start..start + len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VALID: &[&str] = &[
        "DE89370400440532013000",
        "GB29NWBK60161331926819",
        "FR1420041010050500013M02606",
        "NL91ABNA0417164300",
        "AT611904300234573201",
    ];

    #[test]
    fn normalize_strips_separators_and_uppercases() {
        assert_eq!(
            normalize("de89 3704-0044 0532 0130 00"),
            "DE89370400440532013000"
        );
    }

    #[test]
    fn known_ibans_validate() {
        for iban in VALID {
            assert!(is_valid(iban), "{iban} should validate");
        }
    }

    #[test]
    fn checksum_damage_is_detected() {
        // Flip one digit of an otherwise valid IBAN.
        assert!(!is_valid("DE89370400440532013001"));
        assert!(!is_valid("DE88370400440532013000"));
    }

    #[test]
    fn structural_rejects() {
        assert!(!is_valid("DE8937040044"));               // too short
        assert!(!is_valid("1E89370400440532013000"));     // digit country
        assert!(!is_valid("DEA9370400440532013000"));     // letter check digit
        assert!(!is_valid("DE89 370400440532013000"));    // not normalized
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let h = hash("DE89370400440532013000");
        assert_eq!(h.len(), 64);
        assert!(h.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn mask_keeps_prefix_and_suffix() {
        assert_eq!(
            mask("DE89370400440532013000"),
            "DE89**************3000"
        );
        assert_eq!(mask("SHORT"), "*****");
    }

    #[test]
    fn bank_code_extraction() {
        assert_eq!(bank_code("DE89370400440532013000"), Some("37040044"));
        assert_eq!(bank_code("NL91ABNA0417164300"), Some("ABNA"));
        assert_eq!(bank_code("FR1420041010050500013M02606"), Some("20041"));
        // Italian CIN letter is skipped.
        assert_eq!(bank_code("IT60X0542811101000000123456"), Some("05428"));
        assert_eq!(bank_code("XX0012345678901234"), None);
    }

    #[test]
    fn sepa_membership() {
        assert!(is_sepa("DE"));
        assert!(is_sepa("VA"));
        assert!(!is_sepa("US"));
        assert!(!is_sepa("BR"));
    }

    proptest! {
        #[test]
        fn hash_is_stable(s in "[A-Z0-9]{15,34}") {
            prop_assert_eq!(hash(&s), hash(&s));
        }

        #[test]
        fn normalize_is_idempotent(s in "\\PC{0,40}") {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once);
        }

        #[test]
        fn valid_implies_bounds(s in "[A-Z]{2}[0-9]{2}[A-Z0-9]{11,30}") {
            if is_valid(&s) {
                prop_assert!(s.len() >= 15 && s.len() <= 34);
                prop_assert!(s.as_bytes()[0].is_ascii_uppercase());
                prop_assert!(s.as_bytes()[1].is_ascii_uppercase());
            }
        }
    }
}
