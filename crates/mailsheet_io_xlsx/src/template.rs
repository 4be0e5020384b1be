//! Template-driven export.
//!
//! The template is copied first and only the copy is edited. All edits are made on
//! in-memory part models and persisted with a single package save.

use std::fs;

use regex::Regex;

use crate::conf::{
    C_HIGHLIGHT_FILL_ARGB, C_PATTERN_IDENTITY_STRIP, N_NROWS_EXCEL_MAX, N_NUM_FMT_ID_DATETIME,
};
use crate::package::{C_REL_TYPE_STYLES, SpecSheetEntry, XlsxPackage};
use crate::sheet::XlsxSheet;
use crate::spec::{
    EnumBindingRule, EnumCellValue, EnumXlsxExportError, SheetCellSource, SpecFieldRegistry,
    SpecOutputRow, SpecTemplateExportOptions, SpecTemplateExportReport,
};
use crate::styles::XlsxStyles;
use crate::util::{
    align_rows, detect_template_header, locate_identity_columns, plan_duplicate_rows,
    plan_freeze_panes, plan_unmerge_data_region, resolve_label_bindings,
};

/// Write `rows` into a copy of the template workbook.
///
/// Columns follow the template header; each label is bound to a row key by
/// [`resolve_label_bindings`]. The template itself is never opened for writing.
pub fn export_rows_to_template(
    options: &SpecTemplateExportOptions,
    registry: &SpecFieldRegistry,
    rows: &[SpecOutputRow],
) -> Result<SpecTemplateExportReport, EnumXlsxExportError> {
    if options.start_row == Some(0) {
        return Err(EnumXlsxExportError::InvalidStartRow(0));
    }
    if !options.path_template.is_file() {
        return Err(EnumXlsxExportError::TemplateNotFound(
            options.path_template.clone(),
        ));
    }

    fs::copy(&options.path_template, &options.path_out)?;
    tracing::debug!(
        template = %options.path_template.display(),
        output = %options.path_out.display(),
        "template copied"
    );

    let mut package = XlsxPackage::open(&options.path_out)?;
    let entry = select_sheet(&package.read_sheet_catalog()?, options.sheet_name.as_deref())?;
    let l_shared_strings = package.read_shared_strings()?;
    let v_sheet_xml = package.read_required_part(&entry.part_name)?;
    let mut sheet = XlsxSheet::parse(
        &entry.name,
        &entry.part_name,
        &v_sheet_xml,
        l_shared_strings,
    )?;
    let mut styles = match package.find_workbook_part(C_REL_TYPE_STYLES)? {
        Some(c_part) => Some(XlsxStyles::parse(
            &c_part,
            &package.read_required_part(&c_part)?,
        )?),
        None => None,
    };

    let header = detect_template_header(&sheet, options.n_cols_header_scan_max)?;
    let n_start_row = options.start_row.unwrap_or(header.header_row + 1);
    if n_start_row as usize - 1 + rows.len() > N_NROWS_EXCEL_MAX {
        return Err(EnumXlsxExportError::OutputRowLimit(rows.len()));
    }

    let l_bindings = resolve_label_bindings(&header.labels, registry, rows);
    let mut report = SpecTemplateExportReport {
        path_out: options.path_out.clone(),
        sheet_name: entry.name.clone(),
        header_row: header.header_row,
        start_row: n_start_row,
        labels: header.labels.clone(),
        ..Default::default()
    };
    for binding in &l_bindings {
        if binding.rule == EnumBindingRule::Unmatched {
            report.warn(format!(
                "Template label {:?} matched no data key; bound to itself.",
                binding.label
            ));
        }
    }

    let l_aligned = align_rows(&l_bindings, rows);
    report.bindings = l_bindings;

    let (l_kept, l_unmerged) = plan_unmerge_data_region(sheet.merged_ranges(), n_start_row);
    sheet.set_merged_ranges(l_kept);
    report.unmerged_ranges = l_unmerged;

    for (idx_row, l_values) in l_aligned.iter().enumerate() {
        let n_row = n_start_row + idx_row as u32;
        for (idx_col, value) in l_values.iter().enumerate() {
            let n_col = idx_col as u32 + 1;
            let n_style = match value {
                EnumCellValue::DateTime(_) => {
                    let n_base = sheet.cell_style(n_row, n_col);
                    let styles = require_styles(&mut styles)?;
                    Some(styles.derive_xf(n_base, None, Some(N_NUM_FMT_ID_DATETIME))?)
                }
                _ => None,
            };
            sheet.set_cell_value(n_row, n_col, value, n_style);
        }
    }
    report.n_rows_written = l_aligned.len();

    if let Some((n_row, n_col)) = plan_freeze_panes(header.header_row, n_start_row) {
        sheet.set_freeze_panes(n_row, n_col);
        report.if_freeze_panes = true;
    }

    report.duplicate_rows = apply_duplicate_highlight(
        &mut sheet,
        &mut styles,
        &header.labels,
        n_start_row,
        report.n_rows_written,
        &mut report.warnings,
    )?;

    package.write_part(sheet.part_name(), sheet.to_xml()?);
    if let Some(styles) = styles.as_ref().filter(|styles| styles.is_dirty()) {
        package.write_part(styles.part_name(), styles.to_xml()?);
    }
    if sheet.if_formula_overwritten() && package.drop_calc_chain()? {
        report.warn("Formula cells were overwritten; calcChain.xml removed.");
    }
    package.save(&options.path_out)?;

    for c_warning in &report.warnings {
        tracing::warn!("{c_warning}");
    }
    tracing::info!(
        output = %report.path_out.display(),
        sheet = %report.sheet_name,
        rows = report.n_rows_written,
        start_row = report.start_row,
        duplicates = report.duplicate_rows.len(),
        "template export finished"
    );
    Ok(report)
}

fn select_sheet(
    l_sheets: &[SpecSheetEntry],
    sheet_name: Option<&str>,
) -> Result<SpecSheetEntry, EnumXlsxExportError> {
    match sheet_name {
        Some(c_name) => l_sheets
            .iter()
            .find(|entry| entry.name == c_name)
            .cloned()
            .ok_or_else(|| EnumXlsxExportError::SheetNotFound {
                name: c_name.to_string(),
                available: l_sheets.iter().map(|entry| entry.name.clone()).collect(),
            }),
        None => l_sheets.first().cloned().ok_or_else(|| {
            EnumXlsxExportError::InvalidPackage("workbook declares no sheets".to_string())
        }),
    }
}

fn require_styles(
    styles: &mut Option<XlsxStyles>,
) -> Result<&mut XlsxStyles, EnumXlsxExportError> {
    styles
        .as_mut()
        .ok_or_else(|| EnumXlsxExportError::InvalidPackage("missing styles part".to_string()))
}

/// Fill every labelled cell of rows whose (surname, first name) repeats.
///
/// Returns the flagged physical rows, ascending.
fn apply_duplicate_highlight(
    sheet: &mut XlsxSheet,
    styles: &mut Option<XlsxStyles>,
    labels: &[String],
    start_row: u32,
    n_rows: usize,
    warnings: &mut Vec<String>,
) -> Result<Vec<u32>, EnumXlsxExportError> {
    let re_strip = Regex::new(C_PATTERN_IDENTITY_STRIP)?;
    let Some(identity) = locate_identity_columns(labels, &re_strip) else {
        warnings.push(
            "Duplicate highlight skipped: first-name or surname column not found.".to_string(),
        );
        return Ok(vec![]);
    };

    let l_identities: Vec<(u32, String, String)> = (0..n_rows as u32)
        .map(|idx_row| {
            let n_row = start_row + idx_row;
            (
                n_row,
                sheet
                    .cell_text(n_row, identity.col_surname)
                    .unwrap_or_default(),
                sheet
                    .cell_text(n_row, identity.col_first_name)
                    .unwrap_or_default(),
            )
        })
        .collect();
    let l_duplicate_rows = plan_duplicate_rows(&l_identities);
    if l_duplicate_rows.is_empty() {
        return Ok(l_duplicate_rows);
    }

    let styles = require_styles(styles)?;
    let n_fill = styles.add_solid_fill(C_HIGHLIGHT_FILL_ARGB)?;
    for &n_row in &l_duplicate_rows {
        for n_col in 1..=labels.len() as u32 {
            let n_xf = styles.derive_xf(sheet.cell_style(n_row, n_col), Some(n_fill), None)?;
            sheet.set_cell_style(n_row, n_col, n_xf);
        }
    }
    tracing::debug!(rows = ?l_duplicate_rows, "duplicate identities highlighted");
    Ok(l_duplicate_rows)
}
