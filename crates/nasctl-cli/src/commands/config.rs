use crate::cli::ConfigCommands;
use crate::config::CliConfig;
use crate::output::OutputFormat;
use anyhow::Result;

/// Execute config subcommand
pub fn execute(config: &CliConfig, cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => show(config, format),
        ConfigCommands::Path => path(config),
    }
}

/// Show the current effective configuration
fn show(config: &CliConfig, format: OutputFormat) -> Result<()> {
    let rendered = match format {
        OutputFormat::Json => config.display_as_json()?,
        OutputFormat::Table => config.display_as_toml()?,
    };
    println!("{}", rendered);
    Ok(())
}

fn path(config: &CliConfig) -> Result<()> {
    match config.source() {
        Some(path) => println!("{}", path.display()),
        None => println!("{} (not present)", CliConfig::default_config_path()?.display()),
    }
    Ok(())
}
