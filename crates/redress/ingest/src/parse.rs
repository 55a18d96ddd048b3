use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Parse an amount recognizing both EU ("1.234,56") and US ("1,234.56")
/// notations.
///
/// Decision rules:
/// - both separators present: the rightmost one is the decimal point
/// - only a comma, followed by 1-2 digits: the comma is the decimal point
/// - otherwise a comma groups thousands
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-'))
        .collect();
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }

    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');
    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            let (decimal, thousands) = if dot > comma { ('.', ',') } else { (',', '.') };
            let without_thousands: String =
                cleaned.chars().filter(|c| *c != thousands).collect();
            without_thousands.replace(decimal, ".")
        }
        (None, Some(comma)) => {
            let decimals = cleaned.len() - comma - 1;
            let comma_count = cleaned.matches(',').count();
            if comma_count == 1 && (1..=2).contains(&decimals) {
                cleaned.replace(',', ".")
            } else {
                cleaned.replace(',', "")
            }
        }
        _ => cleaned,
    };

    Decimal::from_str(&normalized).ok()
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d.%m.%Y",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%d.%m.%y",
];

/// Parse a date from the fixed format list, or from a spreadsheet serial
/// (days since 1899-12-30) when the value is numeric in (10000, 100000).
/// Unparseable values yield `None`, never an error.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(serial) = trimmed.parse::<f64>() {
        let days = serial.trunc() as i64;
        if days > 10_000 && days < 100_000 {
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
            return epoch.checked_add_signed(Duration::days(days));
        }
        return None;
    }

    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    None
}

/// Split a combined name field into (first, last).
///
/// A comma means "Last, First". Otherwise: a single token fills both
/// parts, two tokens map directly, three or more put everything after
/// the first token into the last name. ALLCAPS tokens of three or more
/// characters are title-cased.
pub fn split_name(raw: &str) -> (String, String) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (String::new(), String::new());
    }

    if let Some((last, first)) = trimmed.split_once(',') {
        return (fix_case(first.trim()), fix_case(last.trim()));
    }

    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    match tokens.as_slice() {
        [] => (String::new(), String::new()),
        [only] => (fix_case(only), fix_case(only)),
        [first, last] => (fix_case(first), fix_case(last)),
        [first, rest @ ..] => (fix_case(first), fix_case(&rest.join(" "))),
    }
}

/// Title-case ALLCAPS tokens of length >= 3; everything else untouched.
fn fix_case(part: &str) -> String {
    part.split_whitespace()
        .map(|token| {
            let is_allcaps = token.chars().count() >= 3
                && token.chars().all(|c| !c.is_alphabetic() || c.is_uppercase());
            if is_allcaps {
                title_case(token)
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => {
            first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
        }
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amount_notations_converge() {
        assert_eq!(parse_amount("1.234,56"), Some(dec!(1234.56)));
        assert_eq!(parse_amount("1,234.56"), Some(dec!(1234.56)));
        assert_eq!(parse_amount("5,00"), Some(dec!(5.00)));
        assert_eq!(parse_amount("2,500"), Some(dec!(2500)));
        assert_eq!(parse_amount("19.99"), Some(dec!(19.99)));
        assert_eq!(parse_amount("1,234,567.89"), Some(dec!(1234567.89)));
        assert_eq!(parse_amount("1.234.567,89"), Some(dec!(1234567.89)));
        assert_eq!(parse_amount(" 42 EUR"), Some(dec!(42)));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn dates_from_fixed_formats() {
        let expected = NaiveDate::from_ymd_opt(1984, 3, 7).unwrap();
        for raw in ["1984-03-07", "07.03.1984", "07/03/1984", "07-03-1984", "1984/03/07"] {
            assert_eq!(parse_date(raw), Some(expected), "{raw}");
        }
        // Day-first wins over month-first when both could apply.
        assert_eq!(
            parse_date("03/04/2020"),
            NaiveDate::from_ymd_opt(2020, 4, 3)
        );
        // Month-first still catches dates the day-first format rejects.
        assert_eq!(
            parse_date("12/25/2020"),
            NaiveDate::from_ymd_opt(2020, 12, 25)
        );
    }

    #[test]
    fn dates_from_spreadsheet_serials() {
        assert_eq!(parse_date("44197"), NaiveDate::from_ymd_opt(2021, 1, 1));
        // Outside the plausible serial window: not a date.
        assert_eq!(parse_date("123"), None);
        assert_eq!(parse_date("1000000"), None);
    }

    #[test]
    fn unparseable_dates_are_null() {
        assert_eq!(parse_date("soon"), None);
        assert_eq!(parse_date(""), None);
    }

    #[test]
    fn name_splitting() {
        assert_eq!(split_name("Ada Lovelace"), ("Ada".into(), "Lovelace".into()));
        assert_eq!(split_name("Lovelace, Ada"), ("Ada".into(), "Lovelace".into()));
        assert_eq!(split_name("Cher"), ("Cher".into(), "Cher".into()));
        assert_eq!(
            split_name("Ada King Lovelace"),
            ("Ada".into(), "King Lovelace".into())
        );
        assert_eq!(split_name("ADA LOVELACE"), ("Ada".into(), "Lovelace".into()));
        // Short ALLCAPS tokens are left alone (initials, particles).
        assert_eq!(split_name("JR Smith"), ("JR".into(), "Smith".into()));
    }
}
