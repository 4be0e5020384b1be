//! Plain workbook writer that turns output rows into a polars DataFrame and one sheet.

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use polars::prelude::{AnyValue, Column, DataFrame, NamedFrom, Series};
use rust_xlsxwriter::{Format, FormatAlign, FormatBorder, Workbook, Worksheet, XlsxError};

use crate::conf::{
    C_PLAIN_SHEET_NAME, N_NCOLS_EXCEL_MAX, N_NROWS_EXCEL_MAX, N_WIDTH_CELL_MAX, N_WIDTH_CELL_MIN,
    N_WIDTH_CELL_PADDING, derive_default_xlsx_formats,
};
use crate::spec::{
    EnumCellValue, EnumPlainColumnKind, EnumXlsxExportError, SpecCellFormat, SpecFieldRegistry,
    SpecOutputRow, SpecPlainExportReport,
};
use crate::util::{derive_excel_serial_from_datetime, sanitize_sheet_name};

/// Stateful workbook writer.
pub struct XlsxWriter {
    path_file_out: PathBuf,
    workbook: Workbook,
    fmt_text: SpecCellFormat,
    fmt_decimal: SpecCellFormat,
    fmt_datetime: SpecCellFormat,
    fmt_header: SpecCellFormat,
    if_closed: bool,
}

impl XlsxWriter {
    /// Create writer bound to output path and format presets.
    ///
    /// The workbook is buffered in memory until [`Self::close`] is called.
    pub fn new(
        path_file_out: PathBuf,
        fmt_text: SpecCellFormat,
        fmt_decimal: SpecCellFormat,
        fmt_datetime: SpecCellFormat,
        fmt_header: SpecCellFormat,
    ) -> Self {
        Self {
            path_file_out,
            workbook: Workbook::new(),
            fmt_text,
            fmt_decimal,
            fmt_datetime,
            fmt_header,
            if_closed: false,
        }
    }

    /// Writer using the named presets of [`derive_default_xlsx_formats`].
    pub fn with_default_formats(path_file_out: PathBuf) -> Self {
        let mut dict_fmt = derive_default_xlsx_formats();
        let mut take = |c_name: &str| dict_fmt.remove(c_name).unwrap_or_default();
        let fmt_text = take("text");
        let fmt_decimal = take("decimal");
        let fmt_datetime = take("datetime");
        let fmt_header = take("header");
        Self::new(path_file_out, fmt_text, fmt_decimal, fmt_datetime, fmt_header)
    }

    pub fn file_out(&self) -> &Path {
        &self.path_file_out
    }

    /// Flush workbook to disk. Idempotent.
    pub fn close(&mut self) -> Result<(), EnumXlsxExportError> {
        if self.if_closed {
            return Ok(());
        }
        self.workbook
            .save(&self.path_file_out)
            .map_err(derive_xlsx_error)?;
        self.if_closed = true;
        Ok(())
    }

    /// Write one sheet: a header row of column names, then one row per frame row.
    ///
    /// `kinds` selects the cell format per column; date-time columns hold serial numbers.
    /// Returns the number of data rows written.
    pub fn write_sheet_from_dataframe(
        &mut self,
        df_data: &DataFrame,
        sheet_name: &str,
        kinds: &[EnumPlainColumnKind],
    ) -> Result<usize, EnumXlsxExportError> {
        if self.if_closed {
            return Err(EnumXlsxExportError::Write(
                "Cannot write after close().".to_string(),
            ));
        }
        if kinds.len() != df_data.width() {
            return Err(EnumXlsxExportError::Write(format!(
                "expected {} column kinds, got {}",
                df_data.width(),
                kinds.len()
            )));
        }

        let l_colnames: Vec<String> = df_data
            .get_column_names_str()
            .into_iter()
            .map(ToString::to_string)
            .collect();
        let fmt_header = derive_rust_xlsx_format(&self.fmt_header);
        let l_fmt_by_col: Vec<Format> = kinds
            .iter()
            .map(|kind| {
                derive_rust_xlsx_format(match kind {
                    EnumPlainColumnKind::Text => &self.fmt_text,
                    EnumPlainColumnKind::Number => &self.fmt_decimal,
                    EnumPlainColumnKind::DateTime => &self.fmt_datetime,
                })
            })
            .collect();

        let worksheet = self.workbook.add_worksheet();
        worksheet
            .set_name(sanitize_sheet_name(sheet_name, "_"))
            .map_err(derive_xlsx_error)?;

        for (n_idx_col, c_name) in l_colnames.iter().enumerate() {
            write_cell_with_format(
                worksheet,
                0,
                n_idx_col,
                &EnumCellValue::String(c_name.clone()),
                &fmt_header,
            )?;
        }

        let n_height = df_data.height();
        for (n_idx_col, col) in df_data.get_columns().iter().enumerate() {
            for n_idx_row in 0..n_height {
                let value = derive_cell_value_from_any_value(col.get(n_idx_row).map_err(
                    |err| EnumXlsxExportError::Write(format!("Failed to access cell value: {err}")),
                )?);
                write_cell_with_format(
                    worksheet,
                    n_idx_row + 1,
                    n_idx_col,
                    &value,
                    &l_fmt_by_col[n_idx_col],
                )?;
            }
        }

        for (n_idx_col, c_name) in l_colnames.iter().enumerate() {
            let n_width = (estimate_unicode_string_width(c_name) + N_WIDTH_CELL_PADDING)
                .clamp(N_WIDTH_CELL_MIN, N_WIDTH_CELL_MAX);
            worksheet
                .set_column_width(cast_col_num(n_idx_col)?, n_width as f64)
                .map_err(derive_xlsx_error)?;
        }

        Ok(n_height)
    }
}

////////////////////////////////////////////////////////////////////////////////
// #region PlainExport

/// Export rows as a fresh single-sheet workbook named `Analysis`.
///
/// Columns are the schema keys followed by extra keys in first-seen order. No alias
/// resolution, merging or highlighting is applied.
pub fn export_rows_to_plain_xlsx(
    path_out: &Path,
    registry: &SpecFieldRegistry,
    rows: &[SpecOutputRow],
) -> Result<SpecPlainExportReport, EnumXlsxExportError> {
    if rows.len() + 1 > N_NROWS_EXCEL_MAX {
        return Err(EnumXlsxExportError::OutputRowLimit(rows.len()));
    }
    let l_columns = derive_plain_columns(registry, rows);
    if l_columns.len() > N_NCOLS_EXCEL_MAX {
        return Err(EnumXlsxExportError::Write(format!(
            "Too many columns for one worksheet: {}",
            l_columns.len()
        )));
    }

    let (df_data, l_kinds) = derive_dataframe_from_rows(&l_columns, rows)?;
    let mut writer = XlsxWriter::with_default_formats(path_out.to_path_buf());
    let n_rows_written =
        writer.write_sheet_from_dataframe(&df_data, C_PLAIN_SHEET_NAME, &l_kinds)?;
    writer.close()?;

    let mut report = SpecPlainExportReport {
        path_out: path_out.to_path_buf(),
        sheet_name: C_PLAIN_SHEET_NAME.to_string(),
        columns: l_columns,
        n_rows_written,
        warnings: vec![],
    };
    if rows.is_empty() {
        report.warn("No rows to export; only the header row was written.");
    }
    for c_warning in &report.warnings {
        tracing::warn!("{c_warning}");
    }
    tracing::info!(
        output = %writer.file_out().display(),
        rows = report.n_rows_written,
        columns = report.columns.len(),
        "plain export finished"
    );
    Ok(report)
}

/// Schema keys, then keys outside the schema in first-seen order.
pub fn derive_plain_columns(registry: &SpecFieldRegistry, rows: &[SpecOutputRow]) -> Vec<String> {
    let mut set_columns: IndexSet<String> = registry.schema_keys().iter().cloned().collect();
    for row in rows {
        for c_key in row.keys() {
            if !set_columns.contains(c_key) {
                set_columns.insert(c_key.to_string());
            }
        }
    }
    set_columns.into_iter().collect()
}

/// Column kind from the non-blank values of one column.
pub fn derive_plain_column_kind<'a>(
    values: impl IntoIterator<Item = &'a EnumCellValue>,
) -> EnumPlainColumnKind {
    let mut kind: Option<EnumPlainColumnKind> = None;
    for value in values.into_iter().filter(|value| !value.is_blank()) {
        let kind_value = match value {
            EnumCellValue::Number(_) => EnumPlainColumnKind::Number,
            EnumCellValue::DateTime(_) => EnumPlainColumnKind::DateTime,
            _ => return EnumPlainColumnKind::Text,
        };
        match kind {
            None => kind = Some(kind_value),
            Some(kind_seen) if kind_seen != kind_value => return EnumPlainColumnKind::Text,
            Some(_) => {}
        }
    }
    kind.unwrap_or(EnumPlainColumnKind::Text)
}

/// Typed DataFrame with one column per key; missing and blank values are null.
pub fn derive_dataframe_from_rows(
    columns: &[String],
    rows: &[SpecOutputRow],
) -> Result<(DataFrame, Vec<EnumPlainColumnKind>), EnumXlsxExportError> {
    let mut l_series = Vec::with_capacity(columns.len());
    let mut l_kinds = Vec::with_capacity(columns.len());
    for c_name in columns {
        let l_values: Vec<Option<&EnumCellValue>> =
            rows.iter().map(|row| row.get(c_name)).collect();
        let kind = derive_plain_column_kind(l_values.iter().flatten().copied());
        let series = match kind {
            EnumPlainColumnKind::Text => Series::new(
                c_name.as_str().into(),
                l_values
                    .iter()
                    .map(|value| value.filter(|v| !v.is_blank()).map(EnumCellValue::to_text))
                    .collect::<Vec<Option<String>>>(),
            ),
            EnumPlainColumnKind::Number | EnumPlainColumnKind::DateTime => Series::new(
                c_name.as_str().into(),
                l_values
                    .iter()
                    .map(|value| match value {
                        Some(EnumCellValue::Number(n_value)) => Some(*n_value),
                        Some(EnumCellValue::DateTime(dt_value)) => {
                            derive_excel_serial_from_datetime(dt_value)
                        }
                        _ => None,
                    })
                    .collect::<Vec<Option<f64>>>(),
            ),
        };
        l_series.push(Column::from(series));
        l_kinds.push(kind);
    }
    let df_data = DataFrame::new(l_series)
        .map_err(|err| EnumXlsxExportError::Write(format!("Failed to build DataFrame: {err}")))?;
    Ok((df_data, l_kinds))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region CellWriting

fn estimate_unicode_string_width(s: &str) -> usize {
    let n_ascii = s.chars().filter(|chr| chr.is_ascii()).count();
    let n_non_ascii = s.chars().count().saturating_sub(n_ascii);
    n_ascii + (n_non_ascii as f64 * 1.6).round() as usize
}

fn derive_cell_value_from_any_value(value: AnyValue<'_>) -> EnumCellValue {
    match value {
        AnyValue::Null => EnumCellValue::None,
        AnyValue::String(val) => EnumCellValue::String(val.to_string()),
        AnyValue::StringOwned(val) => EnumCellValue::String(val.to_string()),
        AnyValue::Int64(val) => EnumCellValue::Number(val as f64),
        AnyValue::Float32(val) => EnumCellValue::Number(val as f64),
        AnyValue::Float64(val) => EnumCellValue::Number(val),
        _ => EnumCellValue::String(value.to_string()),
    }
}

fn write_cell_with_format(
    worksheet: &mut Worksheet,
    row_idx: usize,
    col_idx: usize,
    value: &EnumCellValue,
    format: &Format,
) -> Result<(), EnumXlsxExportError> {
    let n_row = cast_row_num(row_idx)?;
    let n_col = cast_col_num(col_idx)?;
    match value {
        EnumCellValue::None => {
            worksheet
                .write_blank(n_row, n_col, format)
                .map_err(derive_xlsx_error)?;
        }
        EnumCellValue::String(val) => {
            worksheet
                .write_string_with_format(n_row, n_col, val, format)
                .map_err(derive_xlsx_error)?;
        }
        EnumCellValue::Number(val) => {
            worksheet
                .write_number_with_format(n_row, n_col, *val, format)
                .map_err(derive_xlsx_error)?;
        }
        EnumCellValue::DateTime(val) => {
            let n_serial = derive_excel_serial_from_datetime(val).ok_or_else(|| {
                EnumXlsxExportError::Write(format!("date out of range: {val}"))
            })?;
            worksheet
                .write_number_with_format(n_row, n_col, n_serial, format)
                .map_err(derive_xlsx_error)?;
        }
    }
    Ok(())
}

fn derive_rust_xlsx_format(spec: &SpecCellFormat) -> Format {
    let mut format = Format::new();

    if let Some(val) = &spec.font_name {
        format = format.set_font_name(val.clone());
    }
    if let Some(val) = spec.font_size {
        format = format.set_font_size(val as f64);
    }
    if spec.bold.unwrap_or(false) {
        format = format.set_bold();
    }

    if let Some(val) = &spec.align
        && let Some(align) = derive_format_align(val)
    {
        format = format.set_align(align);
    }
    if let Some(val) = &spec.valign
        && let Some(align) = derive_format_align(val)
    {
        format = format.set_align(align);
    }

    if let Some(val) = &spec.num_format {
        format = format.set_num_format(val.clone());
    }
    if let Some(val) = spec.border {
        format = format.set_border(derive_format_border(val));
    }

    format
}

fn derive_format_border(border: i64) -> FormatBorder {
    match border {
        1 => FormatBorder::Thin,
        2 => FormatBorder::Medium,
        3 => FormatBorder::Dashed,
        4 => FormatBorder::Dotted,
        5 => FormatBorder::Thick,
        6 => FormatBorder::Double,
        7 => FormatBorder::Hair,
        _ => FormatBorder::None,
    }
}

fn derive_format_align(align: &str) -> Option<FormatAlign> {
    let value = align.trim().to_ascii_lowercase();
    match value.as_str() {
        "general" => Some(FormatAlign::General),
        "left" => Some(FormatAlign::Left),
        "center" => Some(FormatAlign::Center),
        "right" => Some(FormatAlign::Right),
        "top" => Some(FormatAlign::Top),
        "bottom" => Some(FormatAlign::Bottom),
        "vcenter" | "vertical_center" => Some(FormatAlign::VerticalCenter),
        _ => None,
    }
}

fn cast_row_num(value: usize) -> Result<u32, EnumXlsxExportError> {
    u32::try_from(value)
        .map_err(|_| EnumXlsxExportError::Write(format!("row index overflow: {value}")))
}

fn cast_col_num(value: usize) -> Result<u16, EnumXlsxExportError> {
    u16::try_from(value)
        .map_err(|_| EnumXlsxExportError::Write(format!("column index overflow: {value}")))
}

fn derive_xlsx_error(err: XlsxError) -> EnumXlsxExportError {
    EnumXlsxExportError::Write(err.to_string())
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::derive_default_field_registry;
    use chrono::NaiveDate;

    #[test]
    fn test_plain_columns_keep_schema_then_first_seen_extras() {
        let registry = SpecFieldRegistry::new(
            ["Prijmeni", "Jmeno"].map(String::from),
            Vec::<(String, String)>::new(),
        );
        let rows = vec![
            SpecOutputRow::from_iter([("Zdroj", "a"), ("Jmeno", "Jan")]),
            SpecOutputRow::from_iter([("_confidence", "0.9"), ("Zdroj", "b")]),
        ];
        assert_eq!(
            derive_plain_columns(&registry, &rows),
            vec!["Prijmeni", "Jmeno", "Zdroj", "_confidence"]
        );
    }

    #[test]
    fn test_plain_column_kind_ignores_blanks() {
        let dt_value = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap();
        let l_numbers = [
            EnumCellValue::Number(1.0),
            EnumCellValue::None,
            EnumCellValue::from(""),
            EnumCellValue::Number(2.5),
        ];
        let l_dates = [EnumCellValue::DateTime(dt_value), EnumCellValue::None];
        let l_mixed = [EnumCellValue::Number(1.0), EnumCellValue::DateTime(dt_value)];
        let l_text = [EnumCellValue::Number(1.0), EnumCellValue::from("x")];

        assert_eq!(derive_plain_column_kind(&l_numbers), EnumPlainColumnKind::Number);
        assert_eq!(derive_plain_column_kind(&l_dates), EnumPlainColumnKind::DateTime);
        assert_eq!(derive_plain_column_kind(&l_mixed), EnumPlainColumnKind::Text);
        assert_eq!(derive_plain_column_kind(&l_text), EnumPlainColumnKind::Text);
        assert_eq!(
            derive_plain_column_kind(&[EnumCellValue::None]),
            EnumPlainColumnKind::Text
        );
    }

    #[test]
    fn test_dataframe_from_rows_types_columns() {
        let registry = derive_default_field_registry();
        let mut row = SpecOutputRow::new();
        row.insert("Prijmeni", "Novák");
        row.insert("Skore", 3.5);
        let rows = vec![row, SpecOutputRow::from_iter([("Skore", EnumCellValue::None)])];
        let l_columns = derive_plain_columns(&registry, &rows);
        let (df_data, l_kinds) = derive_dataframe_from_rows(&l_columns, &rows).unwrap();

        assert_eq!(df_data.height(), 2);
        assert_eq!(df_data.width(), 11);
        assert_eq!(l_kinds[1], EnumPlainColumnKind::Text);
        assert_eq!(l_kinds[10], EnumPlainColumnKind::Number);
        let col_score = &df_data.get_columns()[10];
        assert_eq!(col_score.get(0).unwrap(), AnyValue::Float64(3.5));
        assert_eq!(col_score.get(1).unwrap(), AnyValue::Null);
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = XlsxWriter::with_default_formats(dir.path().join("x.xlsx"));
        writer.close().unwrap();
        let df_data = DataFrame::empty();
        let err = writer
            .write_sheet_from_dataframe(&df_data, "Analysis", &[])
            .unwrap_err();
        assert!(matches!(err, EnumXlsxExportError::Write(_)));
    }
}
