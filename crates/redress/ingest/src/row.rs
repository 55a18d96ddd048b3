use crate::mapping::{ColumnMapping, Field};
use crate::parse::{parse_amount, parse_date, split_name};
use chrono::NaiveDate;
use redress_types::Meta;
use rust_decimal::Decimal;

/// One spreadsheet row after column mapping and field parsing.
#[derive(Debug, Clone)]
pub struct NormalizedRow {
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    /// Normalized IBAN (may still fail checksum validation).
    pub iban: String,
    pub iban_hash: String,
    pub iban_valid: bool,
    pub country: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: String,
    pub birth_date: Option<NaiveDate>,
    pub bic: Option<String>,
    pub phone: Option<String>,
    pub external_reference: Option<String>,
    /// The raw row keyed by original header, kept for audit.
    pub raw: Meta,
}

const DEFAULT_CURRENCY: &str = "EUR";

fn cell<'a>(cells: &'a [String], mapping: &ColumnMapping, field: Field) -> Option<&'a str> {
    let index = mapping.column_of(field)?;
    let value = cells.get(index)?.trim();
    (!value.is_empty()).then_some(value)
}

impl NormalizedRow {
    pub fn from_cells(cells: &[String], headers: &[String], mapping: &ColumnMapping) -> Self {
        let (first_name, last_name) = match (
            cell(cells, mapping, Field::FirstName),
            cell(cells, mapping, Field::LastName),
        ) {
            (Some(first), Some(last)) => (first.to_string(), last.to_string()),
            (Some(first), None) => (first.to_string(), String::new()),
            (None, Some(last)) => (String::new(), last.to_string()),
            (None, None) => cell(cells, mapping, Field::FullName)
                .map(split_name)
                .unwrap_or_default(),
        };

        let iban = redress_iban::normalize(cell(cells, mapping, Field::Iban).unwrap_or_default());
        let iban_hash = redress_iban::hash(&iban);
        let iban_valid = redress_iban::is_valid(&iban);
        let country = cell(cells, mapping, Field::Country)
            .map(|c| c.trim().to_uppercase())
            .or_else(|| redress_iban::country(&iban).map(str::to_string));

        let raw: serde_json::Map<String, Meta> = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                let value = cells.get(i).cloned().unwrap_or_default();
                (header.clone(), Meta::String(value))
            })
            .collect();

        Self {
            first_name,
            last_name,
            email: cell(cells, mapping, Field::Email).map(str::to_string),
            iban,
            iban_hash,
            iban_valid,
            country,
            amount: cell(cells, mapping, Field::Amount).and_then(parse_amount),
            currency: cell(cells, mapping, Field::Currency)
                .map(|c| c.to_uppercase())
                .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            birth_date: cell(cells, mapping, Field::BirthDate).and_then(parse_date),
            bic: cell(cells, mapping, Field::Bic).map(str::to_string),
            phone: cell(cells, mapping, Field::Phone).map(str::to_string),
            external_reference: cell(cells, mapping, Field::ExternalReference).map(str::to_string),
            raw: Meta::Object(raw),
        }
    }

    /// A row needs an IBAN, a name part and a parseable amount to become
    /// a debtor; anything less is a row error, not a skip.
    pub fn is_storable(&self) -> bool {
        !self.iban.is_empty()
            && (!self.first_name.is_empty() || !self.last_name.is_empty())
            && self.amount.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::build_column_mapping;
    use rust_decimal_macros::dec;

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn full_name_is_split_when_parts_are_missing() {
        let headers = strings(&["IBAN", "Amount", "Name", "Currency"]);
        let mapping = build_column_mapping(&headers).unwrap();
        let row = NormalizedRow::from_cells(
            &strings(&["de89 3704 0044 0532 0130 00", "1.234,56", "Lovelace, Ada", ""]),
            &headers,
            &mapping,
        );
        assert_eq!(row.first_name, "Ada");
        assert_eq!(row.last_name, "Lovelace");
        assert_eq!(row.iban, "DE89370400440532013000");
        assert!(row.iban_valid);
        assert_eq!(row.amount, Some(dec!(1234.56)));
        assert_eq!(row.currency, "EUR");
        assert_eq!(row.country.as_deref(), Some("DE"));
        assert!(row.is_storable());
    }

    #[test]
    fn missing_amount_makes_the_row_unstorable() {
        let headers = strings(&["IBAN", "Amount", "Name"]);
        let mapping = build_column_mapping(&headers).unwrap();
        let row = NormalizedRow::from_cells(
            &strings(&["DE89370400440532013000", "n/a", "Ada Lovelace"]),
            &headers,
            &mapping,
        );
        assert!(!row.is_storable());
    }

    #[test]
    fn raw_row_retains_every_cell() {
        let headers = strings(&["IBAN", "Amount", "Name", "Notes"]);
        let mapping = build_column_mapping(&headers).unwrap();
        let row = NormalizedRow::from_cells(
            &strings(&["DE89370400440532013000", "5,00", "Ada", "call first"]),
            &headers,
            &mapping,
        );
        assert_eq!(row.raw["Notes"], "call first");
        assert_eq!(row.amount, Some(dec!(5.00)));
    }
}
