use crate::cli::JobCommands;
use crate::commands::call;
use crate::config::CliConfig;
use crate::output::{self, OutputFormat};
use anyhow::Result;
use nasctl_protocol::pseudo;
use serde_json::json;

pub async fn execute(config: &CliConfig, cmd: JobCommands, format: OutputFormat) -> Result<()> {
    let (id, local, wait) = match cmd {
        JobCommands::Wait { id, local } => (id, local, true),
        JobCommands::Status { id, local } => (id, local, false),
    };
    let method = job_method(local, wait);
    let result = call::run(config, method, json!([id])).await?;

    let rendered = if local && wait {
        output::render_bulk(&result, format)?
    } else {
        output::render(&result, format)?
    };
    println!("{}", rendered);
    Ok(())
}

/// Daemon-local ids live in a separate table from appliance job ids.
pub fn job_method(local: bool, wait: bool) -> &'static str {
    match (local, wait) {
        (true, true) => pseudo::AWAIT_DAEMON_JOB,
        (true, false) => pseudo::PEEK_DAEMON_JOB,
        (false, true) => pseudo::AWAIT_EXTERNAL_JOB,
        (false, false) => pseudo::PEEK_EXTERNAL_JOB,
    }
}
