use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::models::ProductVariationRecord;

// Excel needs the BOM to read UTF-8 correctly.
const BOM: &[u8] = b"\xEF\xBB\xBF";

/// Append a batch of records to a per-organization store, creating it (BOM +
/// header row) only on first write. Safe to call repeatedly with the same
/// path; the header is never re-written.
pub fn append_records(records: &[ProductVariationRecord], store_path: &Path) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }

    if let Some(parent) = store_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create store directory {}", parent.display()))?;
    }

    let fresh = !store_path.exists()
        || fs::metadata(store_path).map(|m| m.len() == 0).unwrap_or(true);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(store_path)
        .with_context(|| format!("failed to open store {}", store_path.display()))?;

    if fresh {
        file.write_all(BOM)?;
    }

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    if fresh {
        writer.write_record(ProductVariationRecord::HEADERS)?;
    }
    for record in records {
        writer.write_record(record.as_row())?;
    }
    writer.flush()?;

    info!(
        "Appended {} records to {}",
        records.len(),
        store_path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> ProductVariationRecord {
        ProductVariationRecord {
            product_name: name.to_string(),
            variation_name: "赤".to_string(),
            jan_code: "4512345678901".to_string(),
            model_number: "ABC-1".to_string(),
            wholesale_price: "1200".to_string(),
            source_url: "https://example/p/1".to_string(),
        }
    }

    #[test]
    fn header_written_exactly_once_across_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("org.csv");

        append_records(&[record("a")], &store).unwrap();
        append_records(&[record("b"), record("c")], &store).unwrap();

        let raw = fs::read(&store).unwrap();
        assert!(raw.starts_with(BOM), "store must start with a BOM");
        let text = String::from_utf8(raw[BOM.len()..].to_vec()).unwrap();

        let header_lines = text
            .lines()
            .filter(|l| l.starts_with("product_name"))
            .count();
        assert_eq!(header_lines, 1);
        assert_eq!(text.lines().count(), 4); // header + 3 records
    }

    #[test]
    fn bom_written_only_on_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("org.csv");

        append_records(&[record("a")], &store).unwrap();
        append_records(&[record("b")], &store).unwrap();

        let raw = fs::read(&store).unwrap();
        let bom_count = raw.windows(3).filter(|w| *w == BOM).count();
        assert_eq!(bom_count, 1);
    }

    #[test]
    fn empty_batch_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("org.csv");
        append_records(&[], &store).unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn fields_are_written_in_fixed_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("org.csv");
        append_records(&[record("商品")], &store).unwrap();

        let raw = fs::read(&store).unwrap();
        let text = String::from_utf8(raw[BOM.len()..].to_vec()).unwrap();
        let row = text.lines().nth(1).unwrap();
        assert_eq!(
            row,
            "商品,赤,4512345678901,ABC-1,1200,https://example/p/1"
        );
    }
}
