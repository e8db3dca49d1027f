use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::address::{AddressId, AddressRecord};
use crate::errors::{AppError, AppResult};
use crate::store::AddressStore;

const ADDRESS_COLUMNS: [&str; 3] = ["direccion", "dirección", "address"];
pub const MAX_ADDRESS_CHARS: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    pub line: u64,
    pub reason: String,
}

/// Rows that survived validation, in file order. Duplicates are kept here
/// and dropped when persisting.
#[derive(Debug, Clone, Default)]
pub struct ParsedUpload {
    pub rows_found: usize,
    pub addresses: Vec<String>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub source: String,
    pub rows_found: usize,
    pub created: Vec<AddressId>,
    pub duplicates_skipped: usize,
    pub rejected: Vec<RejectedRow>,
}

pub fn parse_csv(bytes: &[u8]) -> AppResult<ParsedUpload> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers = reader.byte_headers()?.clone();
    let column = headers
        .iter()
        .position(|header| {
            let name = String::from_utf8_lossy(header);
            let name = name.trim_start_matches('\u{feff}').trim().to_lowercase();
            ADDRESS_COLUMNS.contains(&name.as_str())
        })
        .ok_or_else(|| {
            AppError::Parse("the file needs a 'direccion' or 'address' column".into())
        })?;

    let mut upload = ParsedUpload::default();
    for record in reader.byte_records() {
        let record = record?;
        upload.rows_found += 1;
        let line = record.position().map(|pos| pos.line()).unwrap_or_default();
        match validate(record.get(column).unwrap_or_default()) {
            Ok(address) => upload.addresses.push(address),
            Err(reason) => {
                debug!(line, %reason, "rejected upload row");
                upload.rejected.push(RejectedRow { line, reason });
            }
        }
    }
    Ok(upload)
}

fn validate(raw: &[u8]) -> Result<String, String> {
    let text = std::str::from_utf8(raw).map_err(|_| "not valid UTF-8".to_string())?;
    let text = text.trim();
    if text.is_empty() {
        return Err("empty address".into());
    }
    if text.chars().count() > MAX_ADDRESS_CHARS {
        return Err(format!("longer than {MAX_ADDRESS_CHARS} characters"));
    }
    if text.chars().any(char::is_control) {
        return Err("contains control characters".into());
    }
    Ok(text.to_string())
}

/// Stores every address not already known by its original text as a new
/// pending record.
pub fn persist_rows(
    store: &dyn AddressStore,
    source: &str,
    upload: ParsedUpload,
) -> AppResult<ImportSummary> {
    let mut seen = HashSet::new();
    let mut created = Vec::new();
    let mut duplicates_skipped = 0;

    for address in upload.addresses {
        if !seen.insert(address.clone()) || store.find_by_original(&address)?.is_some() {
            duplicates_skipped += 1;
            continue;
        }
        let record = AddressRecord::new(address);
        store.insert(&record)?;
        created.push(record.id);
    }

    info!(
        target: "ingestion",
        source,
        rows_found = upload.rows_found,
        created = created.len(),
        duplicates_skipped,
        rejected = upload.rejected.len(),
        "import finished"
    );

    Ok(ImportSummary {
        source: source.to_string(),
        rows_found: upload.rows_found,
        created,
        duplicates_skipped,
        rejected: upload.rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressStatus;
    use crate::store::MemoryAddressStore;

    #[test]
    fn finds_the_address_column_case_insensitively() {
        let csv = "id,Dirección,ciudad\n1,Cra 7 # 45-10,Bogota\n2,Calle 100 # 15-20,Bogota\n";
        let upload = parse_csv(csv.as_bytes()).unwrap();
        assert_eq!(upload.rows_found, 2);
        assert_eq!(upload.addresses, vec!["Cra 7 # 45-10", "Calle 100 # 15-20"]);
        assert!(upload.rejected.is_empty());
    }

    #[test]
    fn rejects_unusable_rows_with_reasons() {
        let long = "a".repeat(MAX_ADDRESS_CHARS + 1);
        let mut bytes = format!("address\nCalle 1\n\"\"\n{long}\n\"Calle\u{7}2\"\n").into_bytes();
        bytes.extend_from_slice(b"\xff\xfe\n");

        let upload = parse_csv(&bytes).unwrap();
        assert_eq!(upload.rows_found, 5);
        assert_eq!(upload.addresses, vec!["Calle 1"]);
        let reasons: Vec<_> = upload.rejected.iter().map(|r| r.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "empty address",
                "longer than 512 characters",
                "contains control characters",
                "not valid UTF-8",
            ]
        );
        assert_eq!(upload.rejected[0].line, 3);
    }

    #[test]
    fn requires_an_address_column() {
        let err = parse_csv(b"name,city\nfoo,bar\n").unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
    }

    #[test]
    fn skips_duplicates_in_file_and_store() {
        let store = MemoryAddressStore::new();
        store.insert(&AddressRecord::new("Calle 1")).unwrap();
        let upload = parse_csv(b"direccion\nCalle 1\nCalle 2\nCalle 2\nCalle 3\n").unwrap();

        let summary = persist_rows(&store, "upload.csv", upload).unwrap();
        assert_eq!(summary.rows_found, 4);
        assert_eq!(summary.created.len(), 2);
        assert_eq!(summary.duplicates_skipped, 2);
        assert_eq!(store.list(Some(AddressStatus::Pending)).unwrap().len(), 3);
    }
}
