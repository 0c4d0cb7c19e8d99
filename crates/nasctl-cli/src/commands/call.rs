use crate::commands::{finish, remote_api};
use crate::config::CliConfig;
use crate::output::{self, OutputFormat};
use anyhow::Result;
use serde_json::Value;
use tracing::debug;

pub async fn execute(
    config: &CliConfig,
    method: &str,
    args: &[String],
    format: OutputFormat,
) -> Result<()> {
    let result = run(config, method, parse_params(args)).await?;
    println!("{}", output::render(&result, format)?);
    Ok(())
}

/// Forward one call and close the api.
pub async fn run(config: &CliConfig, method: &str, params: Value) -> Result<Value> {
    debug!(method, %params, "Calling");
    let mut api = remote_api(config)?;
    let result = api.call(method, config.timeout(), params).await;
    finish(api, result).await
}

/// Positional parameters: JSON where it parses, plain strings otherwise.
pub fn parse_params(args: &[String]) -> Value {
    Value::Array(args.iter().map(|arg| parse_param(arg)).collect())
}

fn parse_param(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_params_mix_json_and_strings() {
        let params = parse_params(&args(&["tank/old", r#"{"recursive": true}"#, "5", "true"]));
        assert_eq!(params, json!(["tank/old", {"recursive": true}, 5, true]));
    }

    #[test]
    fn test_no_params_is_empty_array() {
        assert_eq!(parse_params(&[]), json!([]));
    }

    #[test]
    fn test_quoted_json_string_is_unwrapped() {
        assert_eq!(parse_params(&args(&["\"42\""])), json!(["42"]));
    }
}
