//! `mailsheet_io_xlsx`:
//! XLSX kernel for exporting extracted contact rows.
//!
//! - `conf`     : constants and default presets
//! - `spec`     : specs/models/options/errors
//! - `util`     : pure helper functions (header detection, label resolution, planning)
//! - `package`  : zip package access and workbook relationships
//! - `sheet`    : editable worksheet model
//! - `styles`   : append-only stylesheet editing
//! - `template` : template-driven export pipeline
//! - `writer`   : plain DataFrame writer kernel
pub mod conf;
pub mod package;
pub mod sheet;
pub mod spec;
pub mod styles;
pub mod template;
pub mod util;
pub mod writer;

pub use conf::{
    C_HIGHLIGHT_FILL_ARGB, C_PLAIN_SHEET_NAME, L_SCHEMA_KEYS_CONTACT, N_NCOLS_HEADER_SCAN_MAX,
    N_NROWS_EXCEL_MAX, TUP_HEADER_ALIASES, derive_default_field_registry,
};
pub use package::XlsxPackage;
pub use sheet::XlsxSheet;
pub use spec::{
    EnumBindingRule, EnumCellValue, EnumPlainColumnKind, EnumXlsxExportError, SheetCellSource,
    SpecCellFormat, SpecCellRange, SpecDetectedHeader, SpecFieldRegistry, SpecLabelBinding,
    SpecOutputRow, SpecPlainExportReport, SpecTemplateExportOptions, SpecTemplateExportReport,
};
pub use styles::XlsxStyles;
pub use template::export_rows_to_template;
pub use util::{align_rows, detect_template_header, resolve_label_bindings};
pub use writer::{XlsxWriter, export_rows_to_plain_xlsx};
