use anyhow::Result;
use macro_engine::Value;
use std::env;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_logging() -> Result<()> {
    let log_level = env::var("LOG_LEVEL")
        .map(|level| match level.to_lowercase().as_str() {
            "error" => Level::ERROR,
            "warn" => Level::WARN,
            "info" => Level::INFO,
            "debug" => Level::DEBUG,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    Ok(())
}

/// Parses `name=value` into an initial run variable. The value is typed the
/// way rendered templates are: bool, number, otherwise text.
pub fn parse_var(arg: &str) -> std::result::Result<(String, Value), String> {
    let (name, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{arg}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing variable name in '{arg}'"));
    }
    Ok((name.to_string(), Value::infer(value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("count=3").unwrap(), ("count".to_string(), Value::Number(3.0)));
        assert_eq!(parse_var("on=true").unwrap().1, Value::Bool(true));
        assert_eq!(
            parse_var("target=big dragon").unwrap().1,
            Value::Text("big dragon".into())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=5").is_err());
    }
}
