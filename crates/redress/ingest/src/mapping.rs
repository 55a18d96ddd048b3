use crate::error::{IngestError, IngestResult};
use redress_types::Meta;
use std::collections::HashMap;

/// Canonical spreadsheet fields the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Iban,
    FirstName,
    LastName,
    FullName,
    Email,
    Phone,
    Amount,
    Currency,
    Country,
    BirthDate,
    Bic,
    ExternalReference,
    Address,
    City,
    Zip,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iban => "iban",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::FullName => "full_name",
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Amount => "amount",
            Self::Currency => "currency",
            Self::Country => "country",
            Self::BirthDate => "birth_date",
            Self::Bic => "bic",
            Self::ExternalReference => "external_reference",
            Self::Address => "address",
            Self::City => "city",
            Self::Zip => "zip",
        }
    }
}

/// Closed synonym table: normalized header -> canonical field.
const SYNONYMS: &[(&str, Field)] = &[
    // IBAN
    ("iban", Field::Iban),
    ("iban number", Field::Iban),
    ("iban no", Field::Iban),
    ("account iban", Field::Iban),
    ("bank account", Field::Iban),
    ("bank account number", Field::Iban),
    ("account number", Field::Iban),
    ("konto", Field::Iban),
    ("kontonummer", Field::Iban),
    // Names
    ("first name", Field::FirstName),
    ("firstname", Field::FirstName),
    ("given name", Field::FirstName),
    ("vorname", Field::FirstName),
    ("last name", Field::LastName),
    ("lastname", Field::LastName),
    ("surname", Field::LastName),
    ("family name", Field::LastName),
    ("nachname", Field::LastName),
    ("name", Field::FullName),
    ("full name", Field::FullName),
    ("customer name", Field::FullName),
    ("account holder", Field::FullName),
    ("holder", Field::FullName),
    ("debtor name", Field::FullName),
    // Contact
    ("email", Field::Email),
    ("e mail", Field::Email),
    ("email address", Field::Email),
    ("mail", Field::Email),
    ("phone", Field::Phone),
    ("phone number", Field::Phone),
    ("telephone", Field::Phone),
    ("mobile", Field::Phone),
    ("telefon", Field::Phone),
    // Money
    ("amount", Field::Amount),
    ("amount due", Field::Amount),
    ("open amount", Field::Amount),
    ("sum", Field::Amount),
    ("total", Field::Amount),
    ("betrag", Field::Amount),
    ("currency", Field::Currency),
    ("ccy", Field::Currency),
    ("waehrung", Field::Currency),
    // Location
    ("country", Field::Country),
    ("country code", Field::Country),
    ("land", Field::Country),
    ("address", Field::Address),
    ("street", Field::Address),
    ("city", Field::City),
    ("town", Field::City),
    ("zip", Field::Zip),
    ("zip code", Field::Zip),
    ("postal code", Field::Zip),
    ("plz", Field::Zip),
    // Misc
    ("birth date", Field::BirthDate),
    ("birthdate", Field::BirthDate),
    ("date of birth", Field::BirthDate),
    ("dob", Field::BirthDate),
    ("geburtsdatum", Field::BirthDate),
    ("bic", Field::Bic),
    ("swift", Field::Bic),
    ("swift code", Field::Bic),
    ("bic code", Field::Bic),
    ("reference", Field::ExternalReference),
    ("external reference", Field::ExternalReference),
    ("external id", Field::ExternalReference),
    ("customer id", Field::ExternalReference),
    ("ref", Field::ExternalReference),
];

/// Lowercase, replace punctuation with spaces, collapse whitespace.
pub fn normalize_header(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Header positions resolved to canonical fields.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    /// column index -> field
    columns: HashMap<usize, Field>,
    /// original header -> field name, for the upload record
    by_header: HashMap<String, &'static str>,
}

impl ColumnMapping {
    pub fn field_at(&self, column: usize) -> Option<Field> {
        self.columns.get(&column).copied()
    }

    pub fn column_of(&self, field: Field) -> Option<usize> {
        self.columns
            .iter()
            .find(|(_, f)| **f == field)
            .map(|(i, _)| *i)
    }

    pub fn has(&self, field: Field) -> bool {
        self.columns.values().any(|f| *f == field)
    }

    /// JSON document persisted on the upload.
    pub fn to_meta(&self) -> Meta {
        let map: serde_json::Map<String, Meta> = self
            .by_header
            .iter()
            .map(|(header, field)| (header.clone(), Meta::String((*field).to_string())))
            .collect();
        Meta::Object(map)
    }
}

/// Resolve headers case/space/punctuation-insensitively against the
/// synonym table. The first column claiming a field wins; mandatory
/// fields are an IBAN column, an amount column, and a name column (full
/// or first/last).
pub fn build_column_mapping(headers: &[String]) -> IngestResult<ColumnMapping> {
    let mut mapping = ColumnMapping::default();
    for (index, header) in headers.iter().enumerate() {
        let normalized = normalize_header(header);
        let Some((_, field)) = SYNONYMS.iter().find(|(alias, _)| *alias == normalized) else {
            continue;
        };
        if mapping.has(*field) {
            continue;
        }
        mapping.columns.insert(index, *field);
        mapping.by_header.insert(header.clone(), field.as_str());
    }

    let mut missing = Vec::new();
    if !mapping.has(Field::Iban) {
        missing.push("iban");
    }
    if !mapping.has(Field::Amount) {
        missing.push("amount");
    }
    let has_name =
        mapping.has(Field::FullName) || (mapping.has(Field::FirstName) && mapping.has(Field::LastName));
    if !has_name {
        missing.push("name");
    }
    if !missing.is_empty() {
        return Err(IngestError::MissingColumns(missing.join(", ")));
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn header_normalization_is_insensitive() {
        assert_eq!(normalize_header("IBAN Number"), "iban number");
        assert_eq!(normalize_header("iban_number"), "iban number");
        assert_eq!(normalize_header("  iban   number "), "iban number");
        assert_eq!(normalize_header("E-Mail"), "e mail");
    }

    #[test]
    fn synonym_variants_map_to_the_same_field() {
        for header in ["IBAN Number", "iban_number", "iban number", "IBAN"] {
            let mapping =
                build_column_mapping(&headers(&[header, "Amount", "Name"])).unwrap();
            assert_eq!(mapping.field_at(0), Some(Field::Iban), "{header}");
        }
    }

    #[test]
    fn split_name_columns_satisfy_the_name_requirement() {
        let mapping = build_column_mapping(&headers(&[
            "IBAN", "Betrag", "Vorname", "Nachname", "E-Mail",
        ]))
        .unwrap();
        assert_eq!(mapping.field_at(1), Some(Field::Amount));
        assert_eq!(mapping.field_at(2), Some(Field::FirstName));
        assert_eq!(mapping.field_at(3), Some(Field::LastName));
        assert_eq!(mapping.field_at(4), Some(Field::Email));
    }

    #[test]
    fn missing_mandatory_columns_are_reported() {
        let err = build_column_mapping(&headers(&["Email", "Phone"])).unwrap_err();
        match err {
            IngestError::MissingColumns(cols) => {
                assert!(cols.contains("iban"));
                assert!(cols.contains("amount"));
                assert!(cols.contains("name"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_headers_are_ignored() {
        let mapping =
            build_column_mapping(&headers(&["IBAN", "Amount", "Name", "Shoe Size"])).unwrap();
        assert_eq!(mapping.field_at(3), None);
    }
}
