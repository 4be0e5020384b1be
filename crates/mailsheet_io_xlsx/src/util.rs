//! Stateless helper utilities used by the template and plain export kernels.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::conf::{
    C_IDENTITY_LEAF_FIRST_NAME, C_IDENTITY_LEAF_SURNAME, C_LABEL_SEPARATOR,
    N_LEN_EXCEL_SHEET_NAME_MAX, N_NCOLS_EXCEL_MAX, N_ROW_HEADER_GROUP, N_ROW_HEADER_LEAF,
    TUP_EXCEL_ILLEGAL,
};
use crate::spec::{
    EnumBindingRule, EnumCellValue, EnumXlsxExportError, SheetCellSource, SpecCellRange,
    SpecDetectedHeader, SpecFieldRegistry, SpecIdentityColumns, SpecLabelBinding, SpecOutputRow,
};

////////////////////////////////////////////////////////////////////////////////
// #region CellReferences

/// Convert a 1-based column number to letters (`1 -> A`, `28 -> AB`).
pub fn derive_column_name(col: u32) -> String {
    let mut n_col = col;
    let mut l_chars = Vec::new();
    while n_col > 0 {
        let n_rem = (n_col - 1) % 26;
        l_chars.push((b'A' + n_rem as u8) as char);
        n_col = (n_col - 1) / 26;
    }
    l_chars.iter().rev().collect()
}

/// Convert column letters to a 1-based column number.
pub fn derive_column_number(name: &str) -> Option<u32> {
    if name.is_empty() {
        return None;
    }
    let mut n_col: u32 = 0;
    for chr in name.chars() {
        if !chr.is_ascii_alphabetic() {
            return None;
        }
        let n_digit = (chr.to_ascii_uppercase() as u8 - b'A') as u32 + 1;
        n_col = n_col.checked_mul(26)?.checked_add(n_digit)?;
    }
    if n_col as usize > N_NCOLS_EXCEL_MAX {
        return None;
    }
    Some(n_col)
}

/// Parse an A1 reference (`$` anchors allowed) into 1-based `(row, col)`.
pub fn parse_cell_ref(c_ref: &str) -> Option<(u32, u32)> {
    let c_ref = c_ref.replace('$', "");
    let n_split = c_ref.find(|chr: char| chr.is_ascii_digit())?;
    let (c_col, c_row) = c_ref.split_at(n_split);
    let n_col = derive_column_number(c_col)?;
    let n_row = c_row.parse::<u32>().ok().filter(|n| *n > 0)?;
    Some((n_row, n_col))
}

/// Parse `A1:B2` (or a single `A1`) into a normalized range.
pub fn parse_cell_range(c_ref: &str) -> Option<SpecCellRange> {
    let (c_first, c_last) = c_ref.split_once(':').unwrap_or((c_ref, c_ref));
    let (n_row_a, n_col_a) = parse_cell_ref(c_first.trim())?;
    let (n_row_b, n_col_b) = parse_cell_ref(c_last.trim())?;
    Some(SpecCellRange {
        row_first: n_row_a.min(n_row_b),
        col_first: n_col_a.min(n_col_b),
        row_last: n_row_a.max(n_row_b),
        col_last: n_col_a.max(n_col_b),
    })
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region TextNormalization

/// Lowercase and keep only alphanumeric characters (diacritics are kept).
pub fn normalize_label_key(label: &str) -> String {
    label
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|chr| chr.is_alphanumeric())
        .collect()
}

/// Compatibility-decompose, drop combining marks, lowercase, strip `re_strip` matches.
pub fn normalize_identity_text(text: &str, re_strip: &Regex) -> String {
    let c_folded: String = text
        .nfkd()
        .filter(|chr| !is_combining_mark(*chr))
        .collect::<String>()
        .to_lowercase();
    re_strip.replace_all(&c_folded, "").into_owned()
}

/// Trailing segment of a combined `group | leaf` label, trimmed.
pub fn derive_label_leaf(label: &str) -> &str {
    label.rsplit('|').next().unwrap_or(label).trim()
}

fn derive_header_text(value: Option<&str>) -> String {
    value.map(|c_val| c_val.trim().to_string()).unwrap_or_default()
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region HeaderDetection

/// Reconcile the group row (1) and leaf row (2) into one label per column.
///
/// Trailing columns whose leaf cell is missing or `""` are dropped; a whitespace-only
/// leaf still counts as a column. The reported header row is always the leaf row.
pub fn detect_template_header<S: SheetCellSource + ?Sized>(
    source: &S,
    n_cols_max: u32,
) -> Result<SpecDetectedHeader, EnumXlsxExportError> {
    let mut l_group: Vec<Option<String>> = (1..=n_cols_max)
        .map(|n_col| source.cell_text(N_ROW_HEADER_GROUP, n_col))
        .collect();
    let mut l_leaf: Vec<Option<String>> = (1..=n_cols_max)
        .map(|n_col| source.cell_text(N_ROW_HEADER_LEAF, n_col))
        .collect();

    while l_leaf
        .last()
        .is_some_and(|c_leaf| c_leaf.as_deref().is_none_or(str::is_empty))
    {
        l_leaf.pop();
        l_group.pop();
    }

    let labels: Vec<String> = l_group
        .iter()
        .zip(l_leaf.iter())
        .map(|(c_group, c_leaf)| {
            (
                derive_header_text(c_group.as_deref()),
                derive_header_text(c_leaf.as_deref()),
            )
        })
        .map(|(c_group, c_leaf)| match (c_group.is_empty(), c_leaf.is_empty()) {
            (false, false) => format!("{c_group}{C_LABEL_SEPARATOR}{c_leaf}"),
            (true, false) => c_leaf,
            _ => c_group,
        })
        .collect();

    if labels.is_empty() {
        return Err(EnumXlsxExportError::TemplateHeaderNotDetected);
    }

    Ok(SpecDetectedHeader {
        header_row: N_ROW_HEADER_LEAF,
        labels,
    })
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region LabelResolution

/// Inputs shared by all label resolver strategies.
pub struct SpecLabelResolveContext<'a> {
    /// Alias table source.
    pub registry: &'a SpecFieldRegistry,
    /// Normalized data key to original data key.
    pub dict_data_keys_norm: BTreeMap<String, String>,
}

impl<'a> SpecLabelResolveContext<'a> {
    pub fn new(registry: &'a SpecFieldRegistry, rows: &[SpecOutputRow]) -> Self {
        Self {
            registry,
            dict_data_keys_norm: derive_data_key_index(rows),
        }
    }
}

/// One resolution strategy: `Some(key)` on a hit.
pub type FnLabelResolver = fn(&str, &SpecLabelResolveContext<'_>) -> Option<String>;

/// Resolver strategies in precedence order; the first hit wins.
pub const L_LABEL_RESOLVERS: [(EnumBindingRule, FnLabelResolver); 4] = [
    (EnumBindingRule::Alias, resolve_label_by_alias),
    (EnumBindingRule::DataKey, resolve_label_by_data_key),
    (EnumBindingRule::LeafAlias, resolve_label_by_leaf_alias),
    (EnumBindingRule::LeafDataKey, resolve_label_by_leaf_data_key),
];

/// Index of keys present in `rows`, keyed by [`normalize_label_key`].
///
/// Keys are visited in sorted order and the first key keeps a colliding slot.
pub fn derive_data_key_index(rows: &[SpecOutputRow]) -> BTreeMap<String, String> {
    let mut l_keys: Vec<&str> = rows.iter().flat_map(SpecOutputRow::keys).collect();
    l_keys.sort_unstable();
    l_keys.dedup();

    let mut dict_index = BTreeMap::new();
    for c_key in l_keys {
        let c_norm = normalize_label_key(c_key);
        if c_norm.is_empty() {
            continue;
        }
        dict_index
            .entry(c_norm)
            .or_insert_with(|| c_key.to_string());
    }
    dict_index
}

pub fn resolve_label_by_alias(label: &str, ctx: &SpecLabelResolveContext<'_>) -> Option<String> {
    ctx.registry.resolve_alias(label).map(str::to_string)
}

pub fn resolve_label_by_data_key(
    label: &str,
    ctx: &SpecLabelResolveContext<'_>,
) -> Option<String> {
    let c_norm = normalize_label_key(label);
    if c_norm.is_empty() {
        return None;
    }
    ctx.dict_data_keys_norm.get(&c_norm).cloned()
}

pub fn resolve_label_by_leaf_alias(
    label: &str,
    ctx: &SpecLabelResolveContext<'_>,
) -> Option<String> {
    if !label.contains(C_LABEL_SEPARATOR) {
        return None;
    }
    resolve_label_by_alias(derive_label_leaf(label), ctx)
}

pub fn resolve_label_by_leaf_data_key(
    label: &str,
    ctx: &SpecLabelResolveContext<'_>,
) -> Option<String> {
    if !label.contains(C_LABEL_SEPARATOR) {
        return None;
    }
    resolve_label_by_data_key(derive_label_leaf(label), ctx)
}

/// Bind every label to a source key; unmatched labels bind to themselves.
pub fn resolve_label_bindings(
    labels: &[String],
    registry: &SpecFieldRegistry,
    rows: &[SpecOutputRow],
) -> Vec<SpecLabelBinding> {
    let ctx = SpecLabelResolveContext::new(registry, rows);
    labels
        .iter()
        .map(|c_label| {
            L_LABEL_RESOLVERS
                .iter()
                .find_map(|(rule, fn_resolve)| {
                    fn_resolve(c_label.as_str(), &ctx).map(|c_key| SpecLabelBinding {
                        label: c_label.clone(),
                        key: c_key,
                        rule: *rule,
                    })
                })
                .unwrap_or_else(|| SpecLabelBinding {
                    label: c_label.clone(),
                    key: c_label.clone(),
                    rule: EnumBindingRule::Unmatched,
                })
        })
        .collect()
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region RowAlignment

/// One value per binding for every row; missing keys become empty text.
pub fn align_rows(
    bindings: &[SpecLabelBinding],
    rows: &[SpecOutputRow],
) -> Vec<Vec<EnumCellValue>> {
    rows.iter()
        .map(|row| {
            bindings
                .iter()
                .map(|binding| {
                    row.get(&binding.key)
                        .cloned()
                        .unwrap_or_else(|| EnumCellValue::String(String::new()))
                })
                .collect()
        })
        .collect()
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region SheetWritePlanning

/// Split a merged range snapshot into `(kept, unmerged)`.
///
/// A range is unmerged when its lower edge reaches `start_row` or below.
pub fn plan_unmerge_data_region(
    ranges: &[SpecCellRange],
    start_row: u32,
) -> (Vec<SpecCellRange>, Vec<SpecCellRange>) {
    ranges
        .iter()
        .copied()
        .partition(|range| range.row_last < start_row)
}

/// Frozen pane anchor `(row, col)` for the two-row header convention.
///
/// Only a header on row 2 with data starting on row 3 freezes (at A3).
pub fn plan_freeze_panes(header_row: u32, start_row: u32) -> Option<(u32, u32)> {
    if header_row == N_ROW_HEADER_LEAF && start_row == N_ROW_HEADER_LEAF + 1 {
        Some((start_row, 1))
    } else {
        None
    }
}

/// Excel serial day number (1900 date system) for a local date-time.
pub fn derive_excel_serial_from_datetime(dt: &NaiveDateTime) -> Option<f64> {
    let dt_epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let n_millis = dt.signed_duration_since(dt_epoch).num_milliseconds();
    Some(n_millis as f64 / 86_400_000.0)
}

/// Replace invalid chars and trim to valid Excel sheet name.
pub fn sanitize_sheet_name(name: &str, replace_to: &str) -> String {
    let mut c_name = name.to_string();
    for c_illegal in TUP_EXCEL_ILLEGAL {
        c_name = c_name.replace(c_illegal, replace_to);
    }
    c_name = c_name.trim().to_string();
    if c_name.is_empty() {
        c_name = "Sheet".to_string();
    }

    c_name.chars().take(N_LEN_EXCEL_SHEET_NAME_MAX).collect()
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region DuplicateIdentity

/// Locate the surname and first-name columns by their normalized leaf text.
///
/// The last matching column wins for each role; `None` when either role is missing.
pub fn locate_identity_columns(
    labels: &[String],
    re_strip: &Regex,
) -> Option<SpecIdentityColumns> {
    let mut n_col_first_name = None;
    let mut n_col_surname = None;
    for (idx_col, c_label) in labels.iter().enumerate() {
        let c_norm = normalize_identity_text(derive_label_leaf(c_label), re_strip);
        let n_col = idx_col as u32 + 1;
        if c_norm == C_IDENTITY_LEAF_FIRST_NAME {
            n_col_first_name = Some(n_col);
        } else if c_norm == C_IDENTITY_LEAF_SURNAME {
            n_col_surname = Some(n_col);
        }
    }
    Some(SpecIdentityColumns {
        col_surname: n_col_surname?,
        col_first_name: n_col_first_name?,
    })
}

/// Physical rows whose `(surname, first name)` identity occurs more than once.
///
/// Input items are `(row, surname, first_name)`. Comparison is trimmed and
/// case-insensitive; rows with both names empty never match anything.
pub fn plan_duplicate_rows(identities: &[(u32, String, String)]) -> Vec<u32> {
    let mut dict_buckets: BTreeMap<(String, String), Vec<u32>> = BTreeMap::new();
    for (n_row, c_surname, c_first_name) in identities {
        let c_surname = c_surname.trim();
        let c_first_name = c_first_name.trim();
        if c_surname.is_empty() && c_first_name.is_empty() {
            continue;
        }
        dict_buckets
            .entry((c_surname.to_lowercase(), c_first_name.to_lowercase()))
            .or_default()
            .push(*n_row);
    }

    let mut l_rows: Vec<u32> = dict_buckets
        .into_values()
        .filter(|l_bucket| l_bucket.len() > 1)
        .flatten()
        .collect();
    l_rows.sort_unstable();
    l_rows
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{C_PATTERN_IDENTITY_STRIP, derive_default_field_registry};
    use pretty_assertions::assert_eq;

    struct GridSource(Vec<Vec<&'static str>>);

    impl SheetCellSource for GridSource {
        fn cell_text(&self, row: u32, col: u32) -> Option<String> {
            self.0
                .get(row as usize - 1)?
                .get(col as usize - 1)
                .map(|c_val| c_val.to_string())
        }
    }

    fn row_of(pairs: &[(&str, &str)]) -> SpecOutputRow {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn labels_of(values: &[&str]) -> Vec<String> {
        values.iter().map(|c_val| c_val.to_string()).collect()
    }

    #[test]
    fn test_column_name_round_trip_edges() {
        assert_eq!(derive_column_name(1), "A");
        assert_eq!(derive_column_name(26), "Z");
        assert_eq!(derive_column_name(27), "AA");
        assert_eq!(derive_column_name(16_384), "XFD");
        assert_eq!(derive_column_number("XFD"), Some(16_384));
        assert_eq!(derive_column_number("XFE"), None);
        assert_eq!(parse_cell_ref("$C$12"), Some((12, 3)));
        assert_eq!(parse_cell_ref("C0"), None);
    }

    #[test]
    fn test_parse_cell_range_normalizes_corners() {
        assert_eq!(
            parse_cell_range("B5:A3"),
            Some(SpecCellRange {
                row_first: 3,
                col_first: 1,
                row_last: 5,
                col_last: 2,
            })
        );
        assert_eq!(parse_cell_range("D4").map(|r| r.to_string()), Some("D4".to_string()));
    }

    #[test]
    fn test_detect_header_combines_group_and_leaf_and_trims_tail() {
        let source = GridSource(vec![vec!["A", "A", "", ""], vec!["x", "y", "", ""]]);
        let header = detect_template_header(&source, 120).unwrap();
        assert_eq!(header.header_row, 2);
        assert_eq!(header.labels, labels_of(&["A | x", "A | y"]));
    }

    #[test]
    fn test_detect_header_leaf_only() {
        let source = GridSource(vec![vec![], vec!["x", "y"]]);
        let header = detect_template_header(&source, 120).unwrap();
        assert_eq!(header.labels, labels_of(&["x", "y"]));
    }

    #[test]
    fn test_detect_header_keeps_group_text_for_interior_blank_leaf() {
        let source = GridSource(vec![vec!["Firma", " Osoba ", ""], vec!["", " Jméno ", "Tel"]]);
        let header = detect_template_header(&source, 120).unwrap();
        assert_eq!(header.labels, labels_of(&["Firma", "Osoba | Jméno", "Tel"]));
    }

    #[test]
    fn test_detect_header_respects_column_bound() {
        let source = GridSource(vec![vec![], vec!["a", "b", "c"]]);
        let header = detect_template_header(&source, 2).unwrap();
        assert_eq!(header.labels, labels_of(&["a", "b"]));
    }

    #[test]
    fn test_detect_header_single_row_template_is_not_detected() {
        let source = GridSource(vec![vec!["Jméno", "Příjmení"], vec!["", ""]]);
        assert!(matches!(
            detect_template_header(&source, 120),
            Err(EnumXlsxExportError::TemplateHeaderNotDetected)
        ));
    }

    #[test]
    fn test_detect_header_whitespace_leaf_keeps_group_column() {
        let source = GridSource(vec![vec!["", "Poznámka"], vec!["Jméno", " "]]);
        let header = detect_template_header(&source, 120).unwrap();
        assert_eq!(header.labels, labels_of(&["Jméno", "Poznámka"]));

        let source = GridSource(vec![vec!["Jméno", "Příjmení"], vec![" ", ""]]);
        let header = detect_template_header(&source, 120).unwrap();
        assert_eq!(header.labels, labels_of(&["Jméno"]));
    }

    #[test]
    fn test_resolver_precedence_and_fallbacks() {
        let registry = derive_default_field_registry();
        let rows = vec![row_of(&[("Jmeno", "Jan"), ("_EMAIL_FROM", "jan@example.com")])];
        let labels = labels_of(&[
            "Příjmení*",
            "email from",
            "Osoba | Jméno",
            "Kontakt | _EMAIL_FROM",
            "Poznámka interní",
        ]);

        let bindings = resolve_label_bindings(&labels, &registry, &rows);
        let l_resolved: Vec<(&str, EnumBindingRule)> = bindings
            .iter()
            .map(|binding| (binding.key.as_str(), binding.rule))
            .collect();
        assert_eq!(
            l_resolved,
            vec![
                ("Prijmeni", EnumBindingRule::Alias),
                ("_EMAIL_FROM", EnumBindingRule::DataKey),
                ("Jmeno", EnumBindingRule::LeafAlias),
                ("_EMAIL_FROM", EnumBindingRule::LeafDataKey),
                ("Poznámka interní", EnumBindingRule::Unmatched),
            ]
        );
    }

    #[test]
    fn test_data_key_match_is_diacritic_sensitive() {
        let registry = SpecFieldRegistry::new(Vec::<String>::new(), Vec::<(String, String)>::new());
        let rows = vec![row_of(&[("Prijmeni", "Novák")])];
        let bindings = resolve_label_bindings(&labels_of(&["Příjmení", "PRIJMENI"]), &registry, &rows);
        assert_eq!(bindings[0].rule, EnumBindingRule::Unmatched);
        assert_eq!(bindings[1].key, "Prijmeni");
        assert_eq!(bindings[1].rule, EnumBindingRule::DataKey);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let registry = derive_default_field_registry();
        let rows = vec![
            row_of(&[("Email", "a@b.cz"), ("e_mail", "x")]),
            row_of(&[("E-Mail", "c@d.cz")]),
        ];
        let labels = labels_of(&["E mail", "Kontakt | Email", "WWW"]);
        assert_eq!(
            resolve_label_bindings(&labels, &registry, &rows),
            resolve_label_bindings(&labels, &registry, &rows)
        );
        assert_eq!(derive_data_key_index(&rows).get("email"), Some(&"E-Mail".to_string()));
    }

    #[test]
    fn test_align_rows_unmatched_column_renders_empty() {
        let registry = derive_default_field_registry();
        let rows = vec![
            row_of(&[("Jmeno", "Jan"), ("Prijmeni", "Novák")]),
            row_of(&[("Jmeno", "Eva")]),
        ];
        let labels = labels_of(&["Jméno", "Příjmení", "Neznámý sloupec"]);
        let bindings = resolve_label_bindings(&labels, &registry, &rows);
        let aligned = align_rows(&bindings, &rows);

        assert_eq!(aligned.len(), 2);
        assert!(aligned.iter().all(|row| row.len() == labels.len()));
        assert_eq!(aligned[0][0], EnumCellValue::from("Jan"));
        assert_eq!(aligned[1][1], EnumCellValue::from(""));
        assert_eq!(aligned[0][2], EnumCellValue::from(""));
    }

    #[test]
    fn test_plan_unmerge_keeps_header_merges() {
        let l_ranges = vec![
            parse_cell_range("A1:B2").unwrap(),
            parse_cell_range("C3:C5").unwrap(),
            parse_cell_range("D2:D3").unwrap(),
        ];
        let (l_kept, l_unmerged) = plan_unmerge_data_region(&l_ranges, 3);
        assert_eq!(l_kept, vec![l_ranges[0]]);
        assert_eq!(l_unmerged, vec![l_ranges[1], l_ranges[2]]);
    }

    #[test]
    fn test_plan_freeze_panes_only_for_row2_header_and_row3_start() {
        assert_eq!(plan_freeze_panes(2, 3), Some((3, 1)));
        assert_eq!(plan_freeze_panes(2, 4), None);
        assert_eq!(plan_freeze_panes(1, 3), None);
        assert_eq!(plan_freeze_panes(3, 4), None);
    }

    #[test]
    fn test_excel_serial_from_datetime() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert_eq!(derive_excel_serial_from_datetime(&dt), Some(45_292.5));
    }

    #[test]
    fn test_locate_identity_columns_uses_leaf_and_strips_diacritics() {
        let re_strip = Regex::new(C_PATTERN_IDENTITY_STRIP).unwrap();
        let labels = labels_of(&["Firma", "Osoba | Příjmení *", "Osoba | JMÉNO", "Tel"]);
        assert_eq!(
            locate_identity_columns(&labels, &re_strip),
            Some(SpecIdentityColumns {
                col_surname: 2,
                col_first_name: 3,
            })
        );
        assert_eq!(locate_identity_columns(&labels_of(&["Jméno", "Tel"]), &re_strip), None);
    }

    #[test]
    fn test_plan_duplicate_rows_case_insensitive() {
        let identities = vec![
            (3, "Novak".to_string(), "Jan".to_string()),
            (4, "Svoboda".to_string(), "Eva".to_string()),
            (5, "Novak".to_string(), "jan ".to_string()),
        ];
        assert_eq!(plan_duplicate_rows(&identities), vec![3, 5]);
    }

    #[test]
    fn test_plan_duplicate_rows_ignores_rows_without_names() {
        let identities = vec![
            (3, "".to_string(), "".to_string()),
            (4, " ".to_string(), "".to_string()),
            (5, "".to_string(), "Eva".to_string()),
            (6, "".to_string(), "EVA".to_string()),
        ];
        assert_eq!(plan_duplicate_rows(&identities), vec![5, 6]);
    }

    #[test]
    fn test_sanitize_sheet_name() {
        assert_eq!(sanitize_sheet_name(" a/b:c ", "_"), "a_b_c");
        assert_eq!(sanitize_sheet_name("   ", "_"), "Sheet");
    }
}
