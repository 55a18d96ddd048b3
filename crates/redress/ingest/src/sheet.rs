use crate::error::{IngestError, IngestResult};
use calamine::{open_workbook_auto, Data, Reader};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Accepted spreadsheet formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetKind {
    Csv,
    Tsv,
    Xlsx,
    Xls,
}

impl SheetKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(Self::Csv),
            "tsv" => Some(Self::Tsv),
            "xlsx" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            _ => None,
        }
    }
}

/// A parsed spreadsheet: header row plus data rows as strings.
#[derive(Debug, Clone)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }
}

/// Parse a stored spreadsheet. The first row is always headers; the CSV
/// delimiter is auto-detected (`;` vs `,` by count in the first line).
pub fn parse_file(path: &Path, max_bytes: u64) -> IngestResult<Sheet> {
    let size = fs::metadata(path)
        .map_err(|e| IngestError::File(format!("{}: {e}", path.display())))?
        .len();
    if size > max_bytes {
        return Err(IngestError::TooLarge {
            size,
            limit: max_bytes,
        });
    }

    let kind = SheetKind::from_path(path)
        .ok_or_else(|| IngestError::UnsupportedFormat(path.display().to_string()))?;
    match kind {
        SheetKind::Csv => parse_delimited(path, sniff_delimiter(path)?),
        SheetKind::Tsv => parse_delimited(path, b'\t'),
        SheetKind::Xlsx | SheetKind::Xls => parse_workbook(path),
    }
}

fn sniff_delimiter(path: &Path) -> IngestResult<u8> {
    let file =
        fs::File::open(path).map_err(|e| IngestError::File(format!("{}: {e}", path.display())))?;
    let mut first_line = String::new();
    BufReader::new(file)
        .read_line(&mut first_line)
        .map_err(|e| IngestError::File(e.to_string()))?;
    let semicolons = first_line.matches(';').count();
    let commas = first_line.matches(',').count();
    Ok(if semicolons > commas { b';' } else { b',' })
}

fn parse_delimited(path: &Path, delimiter: u8) -> IngestResult<Sheet> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_path(path)
        .map_err(|e| IngestError::File(e.to_string()))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| IngestError::File(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
        return Err(IngestError::NoHeaders);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| IngestError::File(e.to_string()))?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok(Sheet { headers, rows })
}

fn parse_workbook(path: &Path) -> IngestResult<Sheet> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| IngestError::File(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or(IngestError::NoHeaders)?
        .map_err(|e| IngestError::File(e.to_string()))?;

    let mut iter = range.rows();
    let headers: Vec<String> = iter
        .next()
        .ok_or(IngestError::NoHeaders)?
        .iter()
        .map(cell_to_string)
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(IngestError::NoHeaders);
    }

    let rows = iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();
    Ok(Sheet { headers, rows })
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) if f.fract() == 0.0 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, content: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join(name)).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        dir
    }

    #[test]
    fn comma_csv_round_trips() {
        let dir = write_temp(
            "in.csv",
            "IBAN,Amount,Name\nDE89370400440532013000,20,Ada Lovelace\n",
        );
        let sheet = parse_file(&dir.path().join("in.csv"), 1024).unwrap();
        assert_eq!(sheet.headers, vec!["IBAN", "Amount", "Name"]);
        assert_eq!(sheet.total_rows(), 1);
        assert_eq!(sheet.rows[0][0], "DE89370400440532013000");
    }

    #[test]
    fn semicolon_delimiter_is_sniffed() {
        let dir = write_temp(
            "in.csv",
            "IBAN;Amount;Name\nDE89370400440532013000;20,50;Ada Lovelace\n",
        );
        let sheet = parse_file(&dir.path().join("in.csv"), 1024).unwrap();
        assert_eq!(sheet.headers.len(), 3);
        // The EU decimal comma survives inside the field.
        assert_eq!(sheet.rows[0][1], "20,50");
    }

    #[test]
    fn tsv_files_use_tabs() {
        let dir = write_temp(
            "in.tsv",
            "IBAN\tAmount\tName\nDE89370400440532013000\t20\tAda\n",
        );
        let sheet = parse_file(&dir.path().join("in.tsv"), 1024).unwrap();
        assert_eq!(sheet.rows[0].len(), 3);
    }

    #[test]
    fn oversized_files_are_rejected() {
        let dir = write_temp("in.csv", "IBAN,Amount,Name\n");
        let err = parse_file(&dir.path().join("in.csv"), 4).unwrap_err();
        assert!(matches!(err, IngestError::TooLarge { .. }));
    }

    #[test]
    fn unknown_extensions_are_rejected() {
        let dir = write_temp("in.pdf", "whatever");
        let err = parse_file(&dir.path().join("in.pdf"), 1024).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat(_)));
    }
}
