//! CSV loader for the source collection.
//!
//! Empty cells become absent fields so that imputation has something to do;
//! numeric cells become JSON numbers and everything else stays a string.

use crate::domain::Document;
use crate::error::{EtlError, Result};
use crate::storage::DocumentStore;
use serde::Serialize;
use serde_json::{Number, Value};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub rows: usize,
    pub missing_cells: usize,
    pub replaced: u64,
}

/// Read a CSV file with a header row and insert one document per data row
#[instrument(skip(store))]
pub async fn import_csv(
    store: &dyn DocumentStore,
    collection: &str,
    path: &Path,
    replace: bool,
    batch_size: usize,
) -> Result<ImportSummary> {
    let file = File::open(path)?;
    let (docs, missing_cells) = parse_csv(BufReader::new(file))?;

    let mut summary = ImportSummary {
        rows: docs.len(),
        missing_cells,
        replaced: 0,
    };
    if replace {
        summary.replaced = store.clear(collection).await?;
        debug!("Removed {} existing documents from {}", summary.replaced, collection);
    }

    let mut batch = Vec::with_capacity(batch_size.max(1));
    for doc in docs {
        batch.push(doc);
        if batch.len() >= batch_size.max(1) {
            store.insert_many(collection, std::mem::take(&mut batch)).await?;
        }
    }
    if !batch.is_empty() {
        store.insert_many(collection, batch).await?;
    }

    info!(
        "📥 Imported {} rows into {} ({} empty cells left absent)",
        summary.rows, collection, summary.missing_cells
    );
    Ok(summary)
}

/// Parse CSV text into documents, returning them with the number of empty cells
pub fn parse_csv<R: Read>(reader: R) -> Result<(Vec<Document>, usize)> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let columns: Vec<String> = csv_reader
        .headers()
        .map_err(import_error)?
        .iter()
        .map(str::to_string)
        .collect();
    if columns.is_empty() {
        return Ok((Vec::new(), 0));
    }
    if let Some(blank) = columns.iter().position(|c| c.is_empty()) {
        return Err(EtlError::Import {
            line: 1,
            message: format!("column {} has an empty header", blank + 1),
        });
    }

    let mut docs = Vec::new();
    let mut missing_cells = 0;
    let mut record = csv::StringRecord::new();
    while csv_reader.read_record(&mut record).map_err(import_error)? {
        let mut doc = Document::new();
        for (column, cell) in columns.iter().zip(record.iter()) {
            match parse_cell(cell) {
                Some(value) => {
                    doc.insert(column.clone(), value);
                }
                None => missing_cells += 1,
            }
        }
        docs.push(doc);
    }

    Ok((docs, missing_cells))
}

/// Keep the line number of a malformed record; IO failures stay IO errors
fn import_error(err: csv::Error) -> EtlError {
    let line = err.position().map(|p| p.line() as usize).unwrap_or(0);
    let message = err.to_string();
    match err.into_kind() {
        csv::ErrorKind::Io(e) => EtlError::Io(e),
        _ => EtlError::Import { line, message },
    }
}

/// `None` for an empty cell, a JSON number when the cell parses as one
pub fn parse_cell(cell: &str) -> Option<Value> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Some(Value::Number(n));
        }
    }
    Some(Value::String(cell.to_string()))
}
