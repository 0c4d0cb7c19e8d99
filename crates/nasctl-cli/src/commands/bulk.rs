use crate::commands::{finish, remote_api};
use crate::config::CliConfig;
use crate::output::{self, OutputFormat};
use anyhow::{bail, Context, Result};
use nasctl_protocol::pseudo;
use serde_json::{json, Value};
use tracing::debug;

pub async fn execute(
    config: &CliConfig,
    method: &str,
    params: &str,
    no_wait: bool,
    format: OutputFormat,
) -> Result<()> {
    let sets = parse_sets(params)?;
    let mut api = remote_api(config)?;

    let submitted = api
        .call(pseudo::BULK_CALL, config.timeout(), json!([method, sets]))
        .await;
    let result = match submitted {
        Ok(id) if no_wait => Ok(id),
        Ok(id) => {
            debug!(%id, "Awaiting bulk job");
            api.call(pseudo::AWAIT_DAEMON_JOB, config.timeout(), json!([id]))
                .await
        }
        Err(e) => Err(e),
    };
    let result = finish(api, result).await?;

    if no_wait {
        println!("{}", result);
    } else {
        println!("{}", output::render_bulk(&result, format)?);
    }
    Ok(())
}

/// The parameter sets: a JSON array with one element per call.
pub fn parse_sets(params: &str) -> Result<Value> {
    let sets: Value = serde_json::from_str(params).context("Bulk parameters must be JSON")?;
    if !sets.is_array() {
        bail!("Bulk parameters must be a JSON array of parameter sets");
    }
    Ok(sets)
}
