//! XLSX constants and default preset factories.

use std::collections::BTreeMap;

use crate::spec::{SpecCellFormat, SpecFieldRegistry};

/// Excel worksheet maximum row count.
pub const N_NROWS_EXCEL_MAX: usize = 1_048_576;
/// Excel worksheet maximum column count.
pub const N_NCOLS_EXCEL_MAX: usize = 16_384;
/// Excel sheet name maximum length.
pub const N_LEN_EXCEL_SHEET_NAME_MAX: usize = 31;
/// Characters not allowed in sheet names.
pub const TUP_EXCEL_ILLEGAL: [&str; 7] = ["*", ":", "?", "/", "\\", "[", "]"];

/// Upper bound on columns scanned by header detection.
pub const N_NCOLS_HEADER_SCAN_MAX: u32 = 120;
/// Template row carrying group labels.
pub const N_ROW_HEADER_GROUP: u32 = 1;
/// Template row carrying leaf labels; also the reported header row.
pub const N_ROW_HEADER_LEAF: u32 = 2;
/// Separator between group and leaf text in a combined label.
pub const C_LABEL_SEPARATOR: &str = " | ";

/// Solid fill color (ARGB) applied to duplicate identity rows.
pub const C_HIGHLIGHT_FILL_ARGB: &str = "FFFFC7CE";
/// Built-in Excel number format id for `m/d/yy h:mm`.
pub const N_NUM_FMT_ID_DATETIME: u32 = 22;
/// Normalized leaf text of the first-name column.
pub const C_IDENTITY_LEAF_FIRST_NAME: &str = "jmeno";
/// Normalized leaf text of the surname column.
pub const C_IDENTITY_LEAF_SURNAME: &str = "prijmeni";
/// Characters removed from identity text after diacritics are stripped.
pub const C_PATTERN_IDENTITY_STRIP: &str = r"[^a-z0-9]+";

/// Sheet name used by the plain (non-template) export.
pub const C_PLAIN_SHEET_NAME: &str = "Analysis";
/// Autofit lower bound in character units.
pub const N_WIDTH_CELL_MIN: usize = 8;
/// Autofit upper bound in character units.
pub const N_WIDTH_CELL_MAX: usize = 60;
/// Padding added to inferred column widths.
pub const N_WIDTH_CELL_PADDING: usize = 2;
/// Prefix marking diagnostic (non-schema) row keys.
pub const C_DIAGNOSTIC_KEY_PREFIX: &str = "_";

/// Canonical contact extraction schema, in output order.
pub const L_SCHEMA_KEYS_CONTACT: [&str; 10] = [
    "NazevKlienta",
    "Prijmeni",
    "Jmeno",
    "TitulPred",
    "TitulZa",
    "Funkce",
    "Tel1",
    "Email",
    "WWW",
    "PoznamkaKOsobe",
];

/// Known template label variants and the schema key each one pulls from.
pub const TUP_HEADER_ALIASES: [(&str, &str); 21] = [
    ("NazevKlienta", "NazevKlienta"),
    ("Název Klienta", "NazevKlienta"),
    ("Název klienta*", "NazevKlienta"),
    ("Prijmeni", "Prijmeni"),
    ("Příjmení", "Prijmeni"),
    ("Příjmení*", "Prijmeni"),
    ("Jmeno", "Jmeno"),
    ("Jméno", "Jmeno"),
    ("TitulPred", "TitulPred"),
    ("TitulZa", "TitulZa"),
    ("Titul před", "TitulPred"),
    ("Titul za", "TitulZa"),
    ("Funkce", "Funkce"),
    ("Tel1", "Tel1"),
    ("Tel 1", "Tel1"),
    ("Telefon", "Tel1"),
    ("E-mail", "Email"),
    ("Email", "Email"),
    ("WWW", "WWW"),
    ("PoznamkaKOsobe", "PoznamkaKOsobe"),
    ("Poznámka k osobě", "PoznamkaKOsobe"),
];

/// Build the field registry with the built-in schema and alias table.
pub fn derive_default_field_registry() -> SpecFieldRegistry {
    SpecFieldRegistry::new(
        L_SCHEMA_KEYS_CONTACT.iter().map(|c_key| c_key.to_string()),
        TUP_HEADER_ALIASES
            .iter()
            .map(|(c_label, c_key)| (c_label.to_string(), c_key.to_string())),
    )
}

/// Build default named format presets used by [`crate::writer::XlsxWriter`].
pub fn derive_default_xlsx_formats() -> BTreeMap<String, SpecCellFormat> {
    let cfg_base_fmt_spec = SpecCellFormat {
        font_name: Some("Calibri".to_string()),
        font_size: Some(11),
        align: Some("left".to_string()),
        valign: Some("vcenter".to_string()),
        ..Default::default()
    };

    let mut dict_fmt = BTreeMap::new();
    dict_fmt.insert("text".to_string(), cfg_base_fmt_spec.clone());
    dict_fmt.insert(
        "header".to_string(),
        cfg_base_fmt_spec.with_(SpecCellFormat {
            bold: Some(true),
            border: Some(1),
            align: Some("center".to_string()),
            ..Default::default()
        }),
    );
    dict_fmt.insert(
        "decimal".to_string(),
        cfg_base_fmt_spec.with_(SpecCellFormat {
            num_format: Some("General".to_string()),
            align: Some("right".to_string()),
            ..Default::default()
        }),
    );
    dict_fmt.insert(
        "datetime".to_string(),
        cfg_base_fmt_spec.with_(SpecCellFormat {
            num_format: Some("yyyy-mm-dd hh:mm".to_string()),
            ..Default::default()
        }),
    );

    dict_fmt
}
