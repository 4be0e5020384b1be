//! Row input: a JSON array of flat objects.

use std::fs;
use std::io::Read;

use anyhow::{Context, Result, bail};
use mailsheet_io_xlsx::{EnumCellValue, SpecFieldRegistry, SpecOutputRow};
use serde_json::Value;

/// Read rows from a file, or from stdin when `source` is `-`.
pub fn read_rows(source: &str) -> Result<Vec<SpecOutputRow>> {
    let c_text = if source == "-" {
        let mut c_buf = String::new();
        std::io::stdin()
            .read_to_string(&mut c_buf)
            .context("Failed to read rows from stdin")?;
        c_buf
    } else {
        fs::read_to_string(source).with_context(|| format!("Failed to read rows file {source}"))?
    };
    parse_rows_json(&c_text)
}

/// Parse a JSON array of objects, keeping each object's key order.
pub fn parse_rows_json(text: &str) -> Result<Vec<SpecOutputRow>> {
    let value: Value = serde_json::from_str(text).context("Rows input is not valid JSON")?;
    let Value::Array(l_items) = value else {
        bail!("Rows input must be a JSON array of objects");
    };

    let mut l_rows: Vec<SpecOutputRow> = Vec::with_capacity(l_items.len());
    for (idx, item) in l_items.iter().enumerate() {
        let Value::Object(dict_fields) = item else {
            bail!("Row {idx} is not a JSON object");
        };
        l_rows.push(
            dict_fields
                .iter()
                .map(|(c_key, v)| (c_key.as_str(), derive_cell_value_from_json(v)))
                .collect(),
        );
    }
    Ok(l_rows)
}

fn derive_cell_value_from_json(value: &Value) -> EnumCellValue {
    match value {
        Value::Null => EnumCellValue::None,
        Value::Bool(true) => EnumCellValue::String("True".to_string()),
        Value::Bool(false) => EnumCellValue::String("False".to_string()),
        Value::Number(n) => n
            .as_f64()
            .map_or_else(|| EnumCellValue::String(n.to_string()), EnumCellValue::Number),
        Value::String(s) => EnumCellValue::String(s.clone()),
        Value::Array(_) | Value::Object(_) => EnumCellValue::String(value.to_string()),
    }
}

/// Coerce every row onto the schema when strict mode is on.
pub fn apply_schema_coercion(
    rows: Vec<SpecOutputRow>,
    registry: &SpecFieldRegistry,
    if_strict: bool,
) -> Vec<SpecOutputRow> {
    if !if_strict {
        return rows;
    }
    rows.iter()
        .map(|row| registry.coerce_row_to_schema(row))
        .collect()
}
