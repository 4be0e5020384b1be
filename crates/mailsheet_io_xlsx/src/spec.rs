//! Shared XLSX specification models.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use indexmap::IndexMap;

use crate::conf::C_DIAGNOSTIC_KEY_PREFIX;
use crate::util::derive_column_name;

////////////////////////////////////////////////////////////////////////////////
// #region CellFormatSpecification

/// Cell format specification used by the plain writer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SpecCellFormat {
    /// Font family name.
    pub font_name: Option<String>,
    /// Font size in points.
    pub font_size: Option<i64>,
    /// Bold style.
    pub bold: Option<bool>,

    /// Horizontal alignment.
    pub align: Option<String>,
    /// Vertical alignment.
    pub valign: Option<String>,
    /// Border style for all sides.
    pub border: Option<i64>,

    /// Number format code.
    pub num_format: Option<String>,
}

impl SpecCellFormat {
    /// Return a new format by overlaying `patch` onto `self`.
    pub fn with_(&self, patch: SpecCellFormat) -> SpecCellFormat {
        self.merge(&patch)
    }

    /// Merge two formats with right-side non-`None` overwrite semantics.
    pub fn merge(&self, other: &SpecCellFormat) -> SpecCellFormat {
        SpecCellFormat {
            font_name: other.font_name.clone().or_else(|| self.font_name.clone()),
            font_size: other.font_size.or(self.font_size),
            bold: other.bold.or(self.bold),
            align: other.align.clone().or_else(|| self.align.clone()),
            valign: other.valign.clone().or_else(|| self.valign.clone()),
            border: other.border.or(self.border),
            num_format: other.num_format.clone().or_else(|| self.num_format.clone()),
        }
    }
}

/// Tagged cell value carried from extraction rows to the sheet.
#[derive(Debug, Clone, PartialEq)]
pub enum EnumCellValue {
    /// Missing/blank value.
    None,
    /// Text value.
    String(String),
    /// Numeric value.
    Number(f64),
    /// Local date-time value.
    DateTime(NaiveDateTime),
}

impl EnumCellValue {
    /// `true` for `None` and for empty text.
    pub fn is_blank(&self) -> bool {
        match self {
            EnumCellValue::None => true,
            EnumCellValue::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Render the value as plain text.
    ///
    /// Integral numbers drop the fractional part; date-times use `%Y-%m-%d %H:%M`.
    pub fn to_text(&self) -> String {
        match self {
            EnumCellValue::None => String::new(),
            EnumCellValue::String(s) => s.clone(),
            EnumCellValue::Number(n) => {
                if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
            EnumCellValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        }
    }
}

impl From<&str> for EnumCellValue {
    fn from(value: &str) -> Self {
        EnumCellValue::String(value.to_string())
    }
}

impl From<String> for EnumCellValue {
    fn from(value: String) -> Self {
        EnumCellValue::String(value)
    }
}

impl From<f64> for EnumCellValue {
    fn from(value: f64) -> Self {
        EnumCellValue::Number(value)
    }
}

impl From<NaiveDateTime> for EnumCellValue {
    fn from(value: NaiveDateTime) -> Self {
        EnumCellValue::DateTime(value)
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region OutputRowSpecification

/// One extracted record: semantic key to value, in insertion order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecOutputRow {
    dict_values: IndexMap<String, EnumCellValue>,
}

impl SpecOutputRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`; a replaced key keeps its position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<EnumCellValue>) {
        self.dict_values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&EnumCellValue> {
        self.dict_values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.dict_values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EnumCellValue)> {
        self.dict_values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.dict_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict_values.is_empty()
    }
}

impl<K: Into<String>, V: Into<EnumCellValue>> FromIterator<(K, V)> for SpecOutputRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = SpecOutputRow::new();
        for (key, value) in iter {
            row.insert(key, value);
        }
        row
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region FieldRegistry

/// Canonical schema plus the label alias table.
///
/// Everything is passed in explicitly; nothing is read from the process environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecFieldRegistry {
    l_schema_keys: Vec<String>,
    dict_aliases: BTreeMap<String, String>,
}

impl SpecFieldRegistry {
    /// Build from ordered schema keys and `(label, key)` alias pairs.
    pub fn new(
        schema_keys: impl IntoIterator<Item = String>,
        aliases: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            l_schema_keys: schema_keys.into_iter().collect(),
            dict_aliases: aliases.into_iter().collect(),
        }
    }

    /// Return a copy extended with extra aliases; later entries win on equal labels.
    pub fn with_aliases(mut self, aliases: impl IntoIterator<Item = (String, String)>) -> Self {
        self.dict_aliases.extend(aliases);
        self
    }

    /// Ordered canonical schema keys.
    pub fn schema_keys(&self) -> &[String] {
        &self.l_schema_keys
    }

    /// Exact alias lookup.
    pub fn resolve_alias(&self, label: &str) -> Option<&str> {
        self.dict_aliases.get(label).map(String::as_str)
    }

    /// `true` for keys attached by the pipeline for diagnostics (e.g. `_CONV_ID`).
    pub fn is_diagnostic_key(key: &str) -> bool {
        key.starts_with(C_DIAGNOSTIC_KEY_PREFIX)
    }

    /// Force a row onto the schema: every schema key as text, in schema order.
    ///
    /// Missing and `None` values become `""`. Diagnostic keys are appended unchanged.
    pub fn coerce_row_to_schema(&self, row: &SpecOutputRow) -> SpecOutputRow {
        let mut row_clean = SpecOutputRow::new();
        for c_key in &self.l_schema_keys {
            let c_text = row.get(c_key).map(EnumCellValue::to_text).unwrap_or_default();
            row_clean.insert(c_key.clone(), EnumCellValue::String(c_text));
        }
        for (c_key, value) in row.iter() {
            if Self::is_diagnostic_key(c_key) {
                row_clean.insert(c_key, value.clone());
            }
        }
        row_clean
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region HeaderSpecification

/// Worksheet read access needed by header detection.
pub trait SheetCellSource {
    /// Display text of the cell at 1-based `(row, col)`; `None` when the cell is absent.
    fn cell_text(&self, row: u32, col: u32) -> Option<String>;
}

/// Header detection result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecDetectedHeader {
    /// Row beneath which data starts by default.
    pub header_row: u32,
    /// One label per physical column, left to right.
    pub labels: Vec<String>,
}

/// Strategy that produced a label binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumBindingRule {
    /// Exact alias table hit.
    Alias,
    /// Normalized match against a key present in the rows.
    DataKey,
    /// Alias hit on the trailing segment of a combined label.
    LeafAlias,
    /// Data key hit on the trailing segment of a combined label.
    LeafDataKey,
    /// Nothing matched; the label is bound to itself.
    Unmatched,
}

/// Resolved source key of one template column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecLabelBinding {
    pub label: String,
    pub key: String,
    pub rule: EnumBindingRule,
}

/// 1-based physical columns of the identity pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecIdentityColumns {
    pub col_surname: u32,
    pub col_first_name: u32,
}

/// Rectangular 1-based cell range (inclusive on both ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecCellRange {
    pub row_first: u32,
    pub col_first: u32,
    pub row_last: u32,
    pub col_last: u32,
}

impl fmt::Display for SpecCellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c_first = format!("{}{}", derive_column_name(self.col_first), self.row_first);
        if self.row_first == self.row_last && self.col_first == self.col_last {
            return f.write_str(&c_first);
        }
        write!(
            f,
            "{c_first}:{}{}",
            derive_column_name(self.col_last),
            self.row_last
        )
    }
}

/// Storage kind inferred for one plain-export column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumPlainColumnKind {
    /// Free text.
    Text,
    /// Float64 values.
    Number,
    /// Excel serial date-times.
    DateTime,
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ExportOptions

/// Template export call options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecTemplateExportOptions {
    /// Template workbook; never modified.
    pub path_template: PathBuf,
    /// Destination workbook; overwritten.
    pub path_out: PathBuf,
    /// Target sheet; first sheet when `None`.
    pub sheet_name: Option<String>,
    /// First data row; header row + 1 when `None`.
    pub start_row: Option<u32>,
    /// Column bound for header detection.
    pub n_cols_header_scan_max: u32,
}

impl SpecTemplateExportOptions {
    pub fn new(path_template: impl Into<PathBuf>, path_out: impl Into<PathBuf>) -> Self {
        Self {
            path_template: path_template.into(),
            path_out: path_out.into(),
            sheet_name: None,
            start_row: None,
            n_cols_header_scan_max: crate::conf::N_NCOLS_HEADER_SCAN_MAX,
        }
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ReportSpecification

/// Template export report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecTemplateExportReport {
    pub path_out: PathBuf,
    pub sheet_name: String,
    pub header_row: u32,
    pub start_row: u32,
    pub labels: Vec<String>,
    pub bindings: Vec<SpecLabelBinding>,
    /// Physical data rows populated.
    pub n_rows_written: usize,
    /// Merged ranges removed from the data region.
    pub unmerged_ranges: Vec<SpecCellRange>,
    /// Physical rows flagged as duplicate identities, ascending.
    pub duplicate_rows: Vec<u32>,
    /// Whether the A3 frozen pane was applied.
    pub if_freeze_panes: bool,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
}

/// Plain (non-template) export report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecPlainExportReport {
    pub path_out: PathBuf,
    pub sheet_name: String,
    /// Written column keys, left to right.
    pub columns: Vec<String>,
    pub n_rows_written: usize,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
}

impl SpecTemplateExportReport {
    /// Add a warning message.
    pub fn warn(&mut self, msg: impl AsRef<str>) {
        self.warnings.push(msg.as_ref().to_string());
    }
}

impl SpecPlainExportReport {
    /// Add a warning message.
    pub fn warn(&mut self, msg: impl AsRef<str>) {
        self.warnings.push(msg.as_ref().to_string());
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region ErrorSpecification

/// Errors raised by template and plain exports.
#[derive(Debug, thiserror::Error)]
pub enum EnumXlsxExportError {
    #[error("Template not found: {0}")]
    TemplateNotFound(PathBuf),
    #[error("Template header not detected.")]
    TemplateHeaderNotDetected,
    #[error("Worksheet {name:?} not found; available: {available:?}")]
    SheetNotFound { name: String, available: Vec<String> },
    #[error("start_row must be >= 1, got {0}")]
    InvalidStartRow(u32),
    #[error("Too many rows for one worksheet: {0}")]
    OutputRowLimit(usize),
    #[error("invalid xlsx package: {0}")]
    InvalidPackage(String),
    #[error("xlsx write error: {0}")]
    Write(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Xml(#[from] quick_xml::Error),
    #[error(transparent)]
    XmlAttr(#[from] quick_xml::events::attributes::AttrError),
    #[error(transparent)]
    Encoding(#[from] quick_xml::encoding::EncodingError),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Pattern(#[from] regex::Error),
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::derive_default_field_registry;

    #[test]
    fn test_cell_range_display_uses_a1_refs() {
        let range = SpecCellRange {
            row_first: 3,
            col_first: 1,
            row_last: 5,
            col_last: 28,
        };
        assert_eq!(range.to_string(), "A3:AB5");

        let single = SpecCellRange {
            row_first: 2,
            col_first: 4,
            row_last: 2,
            col_last: 4,
        };
        assert_eq!(single.to_string(), "D2");
    }

    #[test]
    fn test_cell_value_to_text() {
        assert_eq!(EnumCellValue::Number(42.0).to_text(), "42");
        assert_eq!(EnumCellValue::Number(1.5).to_text(), "1.5");
        assert_eq!(EnumCellValue::None.to_text(), "");
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap();
        assert_eq!(EnumCellValue::DateTime(dt).to_text(), "2024-03-01 09:05");
    }

    #[test]
    fn test_coerce_row_to_schema_keeps_schema_order_and_diagnostics() {
        let registry = derive_default_field_registry();
        let mut row = SpecOutputRow::new();
        row.insert("_CONV_ID", "c-1");
        row.insert("Jmeno", "Jan");
        row.insert("Tel1", 603_123_456.0);
        row.insert("Email", EnumCellValue::None);
        row.insert("Unrelated", "dropped");

        let row_clean = registry.coerce_row_to_schema(&row);
        let l_keys: Vec<&str> = row_clean.keys().collect();
        let mut l_expected: Vec<&str> = registry.schema_keys().iter().map(String::as_str).collect();
        l_expected.push("_CONV_ID");
        assert_eq!(l_keys, l_expected);

        assert_eq!(row_clean.get("Tel1"), Some(&EnumCellValue::from("603123456")));
        assert_eq!(row_clean.get("Email"), Some(&EnumCellValue::from("")));
        assert_eq!(row_clean.get("Prijmeni"), Some(&EnumCellValue::from("")));
        assert_eq!(row_clean.get("Unrelated"), None);
    }

    #[test]
    fn test_registry_extra_alias_overrides_builtin() {
        let registry = derive_default_field_registry()
            .with_aliases([("Telefon".to_string(), "Mobil".to_string())]);
        assert_eq!(registry.resolve_alias("Telefon"), Some("Mobil"));
        assert_eq!(registry.resolve_alias("Jméno"), Some("Jmeno"));
        assert_eq!(registry.resolve_alias("jméno"), None);
    }
}
