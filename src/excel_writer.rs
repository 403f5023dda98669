use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook};
use tracing::{error, info};

use crate::models::ProductVariationRecord;

/// Excel rejects these in sheet names and caps the length at 31 characters.
const FORBIDDEN_SHEET_CHARS: [char; 7] = ['/', '\\', '?', '*', '[', ']', ':'];
const SHEET_NAME_MAX: usize = 31;

/// Strip forbidden characters and truncate. Distinct organizations sharing a
/// 31-character prefix collide; the caller logs and skips the later one.
pub fn sanitize_sheet_name(name: &str) -> String {
    name.chars()
        .filter(|c| !FORBIDDEN_SHEET_CHARS.contains(c))
        .take(SHEET_NAME_MAX)
        .collect()
}

/// Incremental workbook writer: one sheet per organization, header styled in
/// the house format, rows appended batch by batch until `save`.
pub struct ExcelExporter {
    workbook: Workbook,
    // organization -> (sheet index, next free row)
    sheets: HashMap<String, (usize, u32)>,
    sheet_names: HashMap<String, String>,
}

impl ExcelExporter {
    pub fn new() -> Self {
        Self {
            workbook: Workbook::new(),
            sheets: HashMap::new(),
            sheet_names: HashMap::new(),
        }
    }

    /// Append rows for one organization, creating its sheet on first call.
    /// Rows are cells in `ProductVariationRecord` field order.
    pub fn append_rows(&mut self, organization: &str, rows: &[Vec<String>]) -> Result<()> {
        let (sheet_idx, mut next_row) = match self.sheets.get(organization).copied() {
            Some(entry) => entry,
            None => self.create_sheet(organization)?,
        };

        let worksheet = self
            .workbook
            .worksheet_from_index(sheet_idx)
            .map_err(|e| anyhow::anyhow!("worksheet lookup failed: {e}"))?;

        for row in rows {
            for (col, cell) in row.iter().enumerate() {
                worksheet.write(next_row, col as u16, cell.as_str())?;
            }
            next_row += 1;
        }

        self.sheets
            .insert(organization.to_string(), (sheet_idx, next_row));
        Ok(())
    }

    fn create_sheet(&mut self, organization: &str) -> Result<(usize, u32)> {
        let sheet_name = sanitize_sheet_name(organization);
        if let Some(taken_by) = self
            .sheet_names
            .iter()
            .find(|(_, n)| **n == sheet_name)
            .map(|(org, _)| org.clone())
        {
            // Open risk: names differing only past the truncation point.
            anyhow::bail!(
                "sheet name {:?} for {:?} collides with {:?}",
                sheet_name,
                organization,
                taken_by
            );
        }

        let header_format = Format::new()
            .set_bold()
            .set_background_color(Color::RGB(0x000080))
            .set_font_color(Color::White)
            .set_border(FormatBorder::Thin);

        let worksheet = self.workbook.add_worksheet();
        worksheet.set_name(&sheet_name)?;
        for (col, header) in ProductVariationRecord::HEADERS.iter().enumerate() {
            worksheet.write_with_format(0, col as u16, *header, &header_format)?;
        }
        worksheet.set_column_width(0, 40)?; // product_name
        worksheet.set_column_width(1, 30)?; // variation_name
        worksheet.set_column_width(2, 16)?; // jan_code
        worksheet.set_column_width(3, 16)?; // model_number
        worksheet.set_column_width(4, 14)?; // wholesale_price
        worksheet.set_column_width(5, 50)?; // source_url
        worksheet.set_freeze_panes(1, 0)?;

        let sheet_idx = self.workbook.worksheets().len() - 1;
        self.sheets
            .insert(organization.to_string(), (sheet_idx, 1));
        self.sheet_names
            .insert(organization.to_string(), sheet_name);
        Ok((sheet_idx, 1))
    }

    pub fn save(mut self, path: &Path) -> Result<()> {
        self.workbook
            .save(path)
            .with_context(|| format!("failed to save workbook {}", path.display()))?;
        Ok(())
    }
}

impl Default for ExcelExporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Consolidate every per-organization store under `stores_dir` into one
/// workbook. A single store failing is logged and skipped, not fatal.
/// Returns the stores that actually landed in the workbook; skipped stores
/// stay on disk as the data of record and must not be cleaned up.
pub fn consolidate(stores_dir: &Path, output_path: &Path) -> Result<Vec<PathBuf>> {
    info!("Consolidating stores into {}", output_path.display());

    let mut store_files: Vec<_> = fs::read_dir(stores_dir)
        .with_context(|| format!("failed to read store dir {}", stores_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
        .collect();
    store_files.sort();

    if store_files.is_empty() {
        info!("No stores found; skipping workbook output");
        return Ok(Vec::new());
    }

    let mut exporter = ExcelExporter::new();
    let mut consolidated = Vec::new();
    for store in &store_files {
        let organization = store
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        match load_store_rows(store) {
            Ok(rows) => match exporter.append_rows(&organization, &rows) {
                Ok(()) => {
                    info!("Sheet added: {} ({} rows)", organization, rows.len());
                    consolidated.push(store.clone());
                }
                Err(e) => error!(
                    "Skipping sheet for {}; its store is kept on disk: {:#}",
                    organization, e
                ),
            },
            Err(e) => error!("Skipping unreadable store {}: {:#}", store.display(), e),
        }
    }

    if let Some(parent) = output_path.parent() {
        fs::create_dir_all(parent)?;
    }
    exporter.save(output_path)?;
    Ok(consolidated)
}

/// Data rows of one store, header skipped. The BOM rides on the first header
/// cell, so header skipping also disposes of it.
fn load_store_rows(store_path: &Path) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(store_path)?;
    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_characters_are_stripped() {
        assert_eq!(sanitize_sheet_name("A/B\\C?D*E[F]G:H"), "ABCDEFGH");
    }

    #[test]
    fn long_names_truncate_to_31_chars() {
        let name = "a".repeat(40);
        assert_eq!(sanitize_sheet_name(&name).chars().count(), 31);
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let name = "株".repeat(40);
        let sanitized = sanitize_sheet_name(&name);
        assert_eq!(sanitized.chars().count(), 31);
    }

    #[test]
    fn colliding_sheet_names_are_rejected_not_silent() {
        let long_a = format!("{}{}", "x".repeat(31), "alpha");
        let long_b = format!("{}{}", "x".repeat(31), "beta");

        let mut exporter = ExcelExporter::new();
        exporter
            .append_rows(&long_a, &[vec!["p".into(); 6]])
            .unwrap();
        let err = exporter.append_rows(&long_b, &[vec!["q".into(); 6]]);
        assert!(err.is_err());
    }

    #[test]
    fn incremental_appends_extend_the_same_sheet() {
        let mut exporter = ExcelExporter::new();
        exporter
            .append_rows("org", &[vec!["a".into(); 6]])
            .unwrap();
        exporter
            .append_rows("org", &[vec!["b".into(); 6], vec!["c".into(); 6]])
            .unwrap();
        // header row + 3 data rows
        assert_eq!(exporter.sheets["org"].1, 4);
    }

    fn sample_record() -> crate::models::ProductVariationRecord {
        crate::models::ProductVariationRecord {
            product_name: "p".into(),
            variation_name: "v".into(),
            jan_code: "1".into(),
            model_number: "m".into(),
            wholesale_price: "100".into(),
            source_url: "https://example".into(),
        }
    }

    #[test]
    fn consolidate_builds_workbook_from_stores() {
        use crate::csv_writer::append_records;

        let dir = tempfile::tempdir().unwrap();
        let stores = dir.path().join("csv");
        let store = stores.join("orgA.csv");
        append_records(&[sample_record()], &store).unwrap();

        let out = dir.path().join("out.xlsx");
        let consolidated = consolidate(&stores, &out).unwrap();
        assert!(out.exists());
        assert_eq!(consolidated, vec![store]);
    }

    #[test]
    fn skipped_store_survives_post_consolidation_cleanup() {
        use crate::csv_writer::append_records;
        use crate::storage::remove_stores;

        let dir = tempfile::tempdir().unwrap();
        let stores = dir.path().join("csv");
        // Same 31-char prefix, so the second sheet name collides.
        let store_a = stores.join(format!("{}{}.csv", "x".repeat(31), "alpha"));
        let store_b = stores.join(format!("{}{}.csv", "x".repeat(31), "beta"));
        append_records(&[sample_record()], &store_a).unwrap();
        append_records(&[sample_record()], &store_b).unwrap();

        let out = dir.path().join("out.xlsx");
        let consolidated = consolidate(&stores, &out).unwrap();
        assert_eq!(consolidated, vec![store_a.clone()]);

        remove_stores(&consolidated);
        assert!(!store_a.exists());
        assert!(store_b.exists(), "skipped store must remain the data of record");
    }
}
