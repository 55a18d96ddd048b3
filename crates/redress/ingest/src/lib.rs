//! Upload ingestion: spreadsheet parsing, header mapping, row
//! normalization and chunked dispatch into the pipeline.
//!
//! The ingestor owns the uploaded file; chunk workers only ever see
//! normalized rows. Small uploads are processed inline, larger ones are
//! split into fixed-size chunks and dispatched onto the queue.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
mod ingestor;
mod mapping;
mod parse;
mod row;
mod sheet;

pub use error::{IngestError, IngestResult};
pub use ingestor::{DebtorChunkJob, Ingestor};
pub use mapping::{build_column_mapping, normalize_header, ColumnMapping, Field};
pub use parse::{parse_amount, parse_date, split_name};
pub use row::NormalizedRow;
pub use sheet::{parse_file, Sheet, SheetKind};
