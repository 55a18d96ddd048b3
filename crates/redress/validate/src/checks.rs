use redress_types::Debtor;
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::OnceLock;

pub const MIN_AMOUNT: Decimal = dec!(1);
pub const MAX_AMOUNT: Decimal = dec!(50000);
pub const MAX_NAME_PART_LEN: usize = 35;

/// Batched blacklist context for one validation run.
#[derive(Debug, Default)]
pub struct RowContext {
    pub name_blacklisted: bool,
    pub email_blacklisted: bool,
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$")
            .expect("email pattern compiles")
    })
}

/// Run all checks in order and collect human-readable messages.
/// An empty result means the debtor is valid.
pub fn validate_debtor(debtor: &Debtor, ctx: &RowContext) -> Vec<String> {
    let mut errors = Vec::new();

    // Required fields.
    if debtor.iban.is_empty() {
        errors.push("iban is required".to_string());
    }
    if debtor.first_name.trim().is_empty() && debtor.last_name.trim().is_empty() {
        errors.push("a first or last name is required".to_string());
    }
    if debtor.amount < MIN_AMOUNT {
        errors.push(format!("amount must be at least {MIN_AMOUNT}"));
    }

    // Name shape.
    for (label, part) in [("first name", &debtor.first_name), ("last name", &debtor.last_name)] {
        if part.chars().count() > MAX_NAME_PART_LEN {
            errors.push(format!("{label} exceeds {MAX_NAME_PART_LEN} characters"));
        }
        if part.chars().any(|c| c.is_ascii_digit()) {
            errors.push(format!("{label} contains digits"));
        }
        if part
            .chars()
            .any(|c| !c.is_alphanumeric() && !matches!(c, ' ' | '-' | '\'' | '.' | ','))
        {
            errors.push(format!("{label} contains disallowed symbols"));
        }
    }

    // IBAN semantics.
    if !debtor.iban.is_empty() {
        if !redress_iban::is_valid(&debtor.iban) {
            errors.push("iban checksum is invalid".to_string());
        }
        match redress_iban::country(&debtor.iban) {
            Some(country) if redress_iban::is_sepa(country) => {}
            Some(country) => errors.push(format!("iban country {country} is not in SEPA")),
            None => errors.push("iban has no recognizable country prefix".to_string()),
        }
    }

    // Amount bounds.
    if debtor.amount > MAX_AMOUNT {
        errors.push(format!("amount exceeds the maximum of {MAX_AMOUNT}"));
    }

    // Email syntax.
    if let Some(email) = debtor.email.as_deref() {
        if !email_pattern().is_match(email) {
            errors.push("email address is not syntactically valid".to_string());
        }
    }

    // Declared country, when present, must be SEPA.
    if let Some(country) = debtor.country.as_deref() {
        if !redress_iban::is_sepa(country) {
            errors.push(format!("country {country} is not in SEPA"));
        }
    }

    // Encoding hygiene over every text field.
    for (label, value) in [
        ("first name", debtor.first_name.as_str()),
        ("last name", debtor.last_name.as_str()),
        ("email", debtor.email.as_deref().unwrap_or_default()),
    ] {
        if let Some(problem) = encoding_problem(value) {
            errors.push(format!("{label} {problem}"));
        }
    }

    // Blacklist (name/email tiers of the dedup rules).
    if ctx.name_blacklisted {
        errors.push("name matches a blacklist entry".to_string());
    }
    if ctx.email_blacklisted {
        errors.push("email matches a blacklist entry".to_string());
    }

    errors
}

/// Detect replacement characters, raw control characters and the classic
/// double-encoded-UTF-8 signature (0xC3 followed by a continuation byte,
/// visible as 'Ã' plus a Latin-1 supplement character).
fn encoding_problem(value: &str) -> Option<&'static str> {
    if value.contains('\u{FFFD}') {
        return Some("contains a replacement character");
    }
    if value
        .chars()
        .any(|c| c.is_control() && c != '\t' && c != '\n')
    {
        return Some("contains raw control characters");
    }
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{C3}' {
            if let Some(next) = chars.peek() {
                if ('\u{80}'..='\u{BF}').contains(next) {
                    return Some("looks like double-encoded UTF-8");
                }
            }
        }
    }
    None
}
