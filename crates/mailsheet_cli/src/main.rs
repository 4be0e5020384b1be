mod config;
mod logging;
mod paths;
mod rows;

use anyhow::{Context, Result};
use clap::Parser;
use mailsheet_io_xlsx::{SpecTemplateExportOptions, export_rows_to_plain_xlsx, export_rows_to_template};

use crate::config::{AppConfig, Cli};
use crate::logging::init_tracing_from_env;
use crate::paths::{derive_output_path, resolve_template_path};
use crate::rows::{apply_schema_coercion, read_rows};

fn main() -> Result<()> {
    let cli = load_cli()?;
    init_tracing_from_env();
    let cfg = AppConfig::from_cli(&cli)?;
    run(&cfg)
}

/// Parse arguments with `.env` files applied; `--env-file` takes precedence over `./.env`.
fn load_cli() -> Result<Cli> {
    let cli = Cli::parse();
    let Some(path_env) = cli.env_file.as_ref() else {
        dotenv::dotenv().ok();
        return Ok(Cli::parse());
    };
    dotenv::from_path(path_env)
        .with_context(|| format!("Failed to load env file {}", path_env.display()))?;
    dotenv::dotenv().ok();
    Ok(Cli::parse())
}

fn run(cfg: &AppConfig) -> Result<()> {
    let l_rows = read_rows(&cfg.rows)?;
    let l_rows = apply_schema_coercion(l_rows, &cfg.registry, cfg.if_strict_schema);
    tracing::info!(
        rows = l_rows.len(),
        source = %cfg.rows,
        strict = cfg.if_strict_schema,
        "rows loaded"
    );

    let path_out = derive_output_path(
        &cfg.dir_output,
        &cfg.output_name,
        chrono::Local::now().naive_local(),
    )?;

    match cfg.template.as_deref() {
        Some(c_template) => {
            let path_template = resolve_template_path(c_template)?;
            let mut options = SpecTemplateExportOptions::new(path_template, &path_out);
            options.sheet_name = cfg.sheet_name.clone();
            options.start_row = cfg.start_row;
            let report = export_rows_to_template(&options, &cfg.registry, &l_rows)
                .with_context(|| format!("Template export to {} failed", path_out.display()))?;
            tracing::info!(
                "Saved {} row(s) into template: {}",
                report.n_rows_written,
                report.path_out.display()
            );
        }
        None => {
            let report = export_rows_to_plain_xlsx(&path_out, &cfg.registry, &l_rows)
                .with_context(|| format!("Export to {} failed", path_out.display()))?;
            tracing::info!(
                "Saved {} row(s) to: {}",
                report.n_rows_written,
                report.path_out.display()
            );
        }
    }
    Ok(())
}
