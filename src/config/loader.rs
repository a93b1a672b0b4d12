use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result, eyre};

use crate::config::models::GatewayConfig;

/// Format by extension; anything unrecognised is read as YAML.
fn format_of(path: &Path) -> FileFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml,
    }
}

/// Parse a configuration document. Sections left out keep their defaults.
pub fn parse_config(contents: &str, format: FileFormat) -> Result<GatewayConfig> {
    Config::builder()
        .add_source(File::from_str(contents, format))
        .build()
        .wrap_err("Failed to parse configuration")?
        .try_deserialize()
        .wrap_err("Configuration does not match the expected schema")
}

/// Read and parse the YAML, JSON or TOML file at `config_path`.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);
    if path.as_os_str().is_empty() {
        return Err(eyre!("No configuration path given"));
    }
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_config(&contents, format_of(path)).with_context(|| format!("Invalid configuration in {}", path.display()))
}
