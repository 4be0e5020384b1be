//! Command-line and environment configuration.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgAction, Parser};
use mailsheet_io_xlsx::{SpecFieldRegistry, derive_default_field_registry};

/// Output file stem used when none is configured.
pub const C_OUTPUT_NAME_DEFAULT: &str = "outlook_analysis";
/// Row forced by `--start-at-row3`.
pub const N_START_ROW_FIXED: u32 = 3;
/// Invisible characters that leak into env values copied from documents.
const L_ENV_NOISE_CHARS: [char; 4] = ['\u{200b}', '\u{200e}', '\u{200f}', '\u{00a0}'];

// #region CommandLine

/// Export extracted contact rows into an xlsx template or a plain workbook.
#[derive(Debug, Clone, Parser)]
#[command(name = "mailsheet", version)]
pub struct Cli {
    /// JSON array of row objects; `-` reads stdin.
    #[arg(value_name = "ROWS")]
    pub rows: String,

    /// Template workbook. Without it a plain `Analysis` workbook is written.
    #[arg(long, env = "TEMPLATE_XLSX", value_parser = parse_clean_text)]
    pub template: Option<String>,

    /// Template sheet; the first sheet when empty.
    #[arg(long, env = "TEMPLATE_SHEET", value_parser = parse_clean_text)]
    pub sheet: Option<String>,

    /// Start writing at row 3 instead of right below the detected header.
    #[arg(
        long = "start-at-row3",
        env = "TEMPLATE_START_AT_ROW3",
        default_value = "true",
        value_parser = parse_flag_text,
        action = ArgAction::Set
    )]
    pub if_start_at_row3: bool,

    /// Explicit first data row; wins over `--start-at-row3`.
    #[arg(long)]
    pub start_row: Option<u32>,

    #[arg(long, env = "OUTPUT_DIR", default_value = ".", value_parser = parse_clean_text)]
    pub output_dir: String,

    #[arg(
        long,
        env = "OUTPUT_NAME",
        default_value = C_OUTPUT_NAME_DEFAULT,
        value_parser = parse_clean_text
    )]
    pub output_name: String,

    /// Force every row onto the contact schema as text.
    #[arg(
        long = "strict-schema",
        env = "STRICT_SCHEMA",
        default_value = "true",
        value_parser = parse_flag_text,
        action = ArgAction::Set
    )]
    pub if_strict_schema: bool,

    /// Extra `Label=Key` alias (repeatable, `;` separated in the env var).
    #[arg(
        long = "alias",
        env = "TEMPLATE_ALIASES",
        value_delimiter = ';',
        value_parser = parse_clean_text
    )]
    pub aliases: Vec<String>,

    /// Extra `.env` file loaded before the working-directory one.
    #[arg(long)]
    pub env_file: Option<PathBuf>,
}

/// Trim, drop surrounding quotes and strip invisible marks.
pub fn clean_env_value(value: &str) -> String {
    value
        .trim()
        .trim_matches('"')
        .trim_matches('\'')
        .chars()
        .filter(|ch| !L_ENV_NOISE_CHARS.contains(ch))
        .collect()
}

fn parse_clean_text(value: &str) -> Result<String, String> {
    Ok(clean_env_value(value))
}

/// Only a case-insensitive `true` enables a flag.
fn parse_flag_text(value: &str) -> Result<bool, String> {
    Ok(clean_env_value(value).eq_ignore_ascii_case("true"))
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region AppConfig

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rows: String,
    pub template: Option<String>,
    pub sheet_name: Option<String>,
    pub start_row: Option<u32>,
    pub dir_output: PathBuf,
    pub output_name: String,
    pub if_strict_schema: bool,
    pub registry: SpecFieldRegistry,
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let l_aliases = parse_alias_pairs(&cli.aliases)?;
        Ok(Self {
            rows: cli.rows.clone(),
            template: derive_non_empty(cli.template.as_deref()),
            sheet_name: derive_non_empty(cli.sheet.as_deref()),
            start_row: resolve_start_row(cli.start_row, cli.if_start_at_row3)?,
            dir_output: PathBuf::from(
                derive_non_empty(Some(cli.output_dir.as_str())).unwrap_or_else(|| ".".to_string()),
            ),
            output_name: cli.output_name.clone(),
            if_strict_schema: cli.if_strict_schema,
            registry: derive_default_field_registry().with_aliases(l_aliases),
        })
    }
}

fn derive_non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|c_value| !c_value.is_empty())
        .map(str::to_string)
}

/// `--start-row` wins; otherwise row 3 when forced, else the detected default.
pub fn resolve_start_row(start_row: Option<u32>, if_start_at_row3: bool) -> Result<Option<u32>> {
    match start_row {
        Some(0) => bail!("--start-row must be >= 1"),
        Some(n_row) => Ok(Some(n_row)),
        None if if_start_at_row3 => Ok(Some(N_START_ROW_FIXED)),
        None => Ok(None),
    }
}

/// Parse `Label=Key` items; blank items are skipped.
pub fn parse_alias_pairs(items: &[String]) -> Result<Vec<(String, String)>> {
    let mut l_pairs = Vec::new();
    for c_item in items {
        let c_item = c_item.trim();
        if c_item.is_empty() {
            continue;
        }
        let Some((c_label, c_key)) = c_item.split_once('=') else {
            bail!("Alias {c_item:?} must look like Label=Key");
        };
        let (c_label, c_key) = (c_label.trim(), c_key.trim());
        if c_label.is_empty() || c_key.is_empty() {
            bail!("Alias {c_item:?} has an empty label or key");
        }
        l_pairs.push((c_label.to_string(), c_key.to_string()));
    }
    Ok(l_pairs)
}

// #endregion
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clean_env_value_strips_quotes_and_marks() {
        assert_eq!(clean_env_value("  \"C:\\sablona.xlsx\"  "), "C:\\sablona.xlsx");
        assert_eq!(clean_env_value("'Kontakty'"), "Kontakty");
        assert_eq!(clean_env_value("\u{200b}out\u{00a0}put\u{200e}\u{200f}"), "output");
    }

    #[test]
    fn test_flag_text_accepts_only_true() {
        assert_eq!(parse_flag_text(" \"TRUE\" "), Ok(true));
        assert_eq!(parse_flag_text("true"), Ok(true));
        assert_eq!(parse_flag_text("false"), Ok(false));
        assert_eq!(parse_flag_text("yes"), Ok(false));
    }

    #[test]
    fn test_resolve_start_row() {
        assert_eq!(resolve_start_row(None, true).unwrap(), Some(3));
        assert_eq!(resolve_start_row(None, false).unwrap(), None);
        assert_eq!(resolve_start_row(Some(5), true).unwrap(), Some(5));
        assert!(resolve_start_row(Some(0), false).is_err());
    }

    #[test]
    fn test_parse_alias_pairs() {
        let l_items = vec![
            " Mobil = Tel1 ".to_string(),
            String::new(),
            "Firma=NazevKlienta".to_string(),
        ];
        assert_eq!(
            parse_alias_pairs(&l_items).unwrap(),
            vec![
                ("Mobil".to_string(), "Tel1".to_string()),
                ("Firma".to_string(), "NazevKlienta".to_string()),
            ]
        );
        assert!(parse_alias_pairs(&["Mobil".to_string()]).is_err());
        assert!(parse_alias_pairs(&["=Tel1".to_string()]).is_err());
    }

    #[test]
    fn test_app_config_from_cli_args() {
        let cli = Cli::try_parse_from([
            "mailsheet",
            "rows.json",
            "--template",
            "\"sablona.xlsx\"",
            "--sheet",
            "",
            "--start-at-row3",
            "false",
            "--strict-schema",
            "FALSE",
            "--output-dir",
            "out",
            "--output-name",
            "kontakty",
            "--alias",
            "Mobil=Tel1;Firma=NazevKlienta",
        ])
        .unwrap();
        let cfg = AppConfig::from_cli(&cli).unwrap();

        assert_eq!(cfg.rows, "rows.json");
        assert_eq!(cfg.template.as_deref(), Some("sablona.xlsx"));
        assert_eq!(cfg.sheet_name, None);
        assert_eq!(cfg.start_row, None);
        assert!(!cfg.if_strict_schema);
        assert_eq!(cfg.dir_output, PathBuf::from("out"));
        assert_eq!(cfg.output_name, "kontakty");
        assert_eq!(cfg.registry.resolve_alias("Mobil"), Some("Tel1"));
        assert_eq!(cfg.registry.resolve_alias("Firma"), Some("NazevKlienta"));
        assert_eq!(cfg.registry.resolve_alias("Příjmení"), Some("Prijmeni"));
    }

    #[test]
    fn test_start_row_override_wins() {
        let cli = Cli::try_parse_from([
            "mailsheet",
            "-",
            "--start-at-row3",
            "true",
            "--start-row",
            "6",
        ])
        .unwrap();
        assert_eq!(AppConfig::from_cli(&cli).unwrap().start_row, Some(6));
    }
}
