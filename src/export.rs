use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::address::AddressRecord;
use crate::errors::AppResult;

pub const EXPORT_COLUMNS: [&str; 16] = [
    "id",
    "original_address",
    "normalized_address",
    "suggested_address",
    "latitude",
    "longitude",
    "postal_code",
    "street_info",
    "neighborhood",
    "apartment_info",
    "notes",
    "provider",
    "confidence",
    "status",
    "created_at",
    "updated_at",
];

#[derive(Serialize)]
struct ExportRow<'a> {
    id: String,
    original_address: &'a str,
    normalized_address: Option<&'a str>,
    suggested_address: Option<&'a str>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    postal_code: Option<&'a str>,
    street_info: Option<&'a str>,
    neighborhood: Option<&'a str>,
    apartment_info: Option<&'a str>,
    notes: Option<&'a str>,
    provider: Option<&'a str>,
    confidence: Option<f64>,
    status: &'static str,
    created_at: String,
    updated_at: String,
}

impl<'a> From<&'a AddressRecord> for ExportRow<'a> {
    fn from(record: &'a AddressRecord) -> Self {
        Self {
            id: record.id.to_string(),
            original_address: &record.original_text,
            normalized_address: record.normalized_text.as_deref(),
            suggested_address: record.suggested_text.as_deref(),
            latitude: record.latitude,
            longitude: record.longitude,
            postal_code: record.postal_code.as_deref(),
            street_info: record.components.street_info.as_deref(),
            neighborhood: record.components.neighborhood.as_deref(),
            apartment_info: record.components.apartment_info.as_deref(),
            notes: record.components.notes.as_deref(),
            provider: record.provider.as_ref().map(|p| p.as_str()),
            confidence: record.confidence,
            status: record.status.as_str(),
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

/// Writes the header and one row per record. Returns the row count.
pub fn write_csv<W: Write>(writer: W, records: &[AddressRecord]) -> AppResult<usize> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(writer);
    writer.write_record(EXPORT_COLUMNS)?;
    for record in records {
        writer.serialize(ExportRow::from(record))?;
    }
    writer.flush()?;
    Ok(records.len())
}

pub fn export_to_path(path: &Path, records: &[AddressRecord]) -> AppResult<usize> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    write_csv(File::create(path)?, records)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::providers::{GeocodeResult, ProviderId};

    #[test]
    fn writes_header_and_rows() {
        let mut verified = AddressRecord::new("Cra 7 # 45-10, Bogota");
        verified
            .mark_normalized("Carrera 7 # 45-10, Bogota".into())
            .unwrap();
        verified.components.street_info = Some("Carrera 7 # 45-10".into());
        verified.components.neighborhood = Some("Bogota".into());
        verified
            .mark_verified(&GeocodeResult {
                suggested_text: "Carrera 7 #45-10, Bogotá".into(),
                latitude: 4.6,
                longitude: -74.07,
                postal_code: Some("110111".into()),
                provider: ProviderId::new("nominatim"),
                confidence: 0.9,
                fetched_at: Utc::now(),
            })
            .unwrap();
        let pending = AddressRecord::new("Calle 1");

        let mut buffer = Vec::new();
        let rows = write_csv(&mut buffer, &[verified.clone(), pending]).unwrap();
        assert_eq!(rows, 2);

        let mut reader = csv::Reader::from_reader(buffer.as_slice());
        let headers: Vec<_> = reader.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, EXPORT_COLUMNS);

        let records: Vec<_> = reader.records().map(Result::unwrap).collect();
        assert_eq!(&records[0][0], verified.id.to_string());
        assert_eq!(&records[0][3], "Carrera 7 #45-10, Bogotá");
        assert_eq!(&records[0][4], "4.6");
        assert_eq!(&records[0][7], "Carrera 7 # 45-10");
        assert_eq!(&records[0][8], "Bogota");
        assert_eq!(&records[0][9], "");
        assert_eq!(&records[0][11], "nominatim");
        assert_eq!(&records[0][13], "verified");
        assert_eq!(&records[1][2], "");
        assert_eq!(&records[1][13], "pending");
    }

    #[test]
    fn empty_export_still_has_a_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/addresses.csv");
        assert_eq!(export_to_path(&path, &[]).unwrap(), 0);
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.trim_end(), EXPORT_COLUMNS.join(","));
    }
}
