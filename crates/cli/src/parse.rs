//! Argument validation that clap alone cannot express. Failures here are
//! usage errors and exit with code 2.

use std::fmt;

use common::params::parse_model_tag;

/// A command-line usage error, distinguished from runtime failures so the
/// binary can exit 2 instead of 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageError(pub String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for UsageError {}

/// Splits migrate arguments into the target controller and the model tags.
/// Requires the controller name plus at least one valid model tag.
pub fn parse_migrate_args(args: &[String]) -> Result<(String, Vec<String>), UsageError> {
    if args.len() < 2 {
        return Err(UsageError(
            "Missing controller and model tag arguments".to_string(),
        ));
    }
    let target = args[0].clone();
    let mut tags = Vec::with_capacity(args.len() - 1);
    for arg in &args[1..] {
        parse_model_tag(arg).map_err(|err| UsageError(err.to_string()))?;
        tags.push(arg.clone());
    }
    Ok((target, tags))
}

/// Parses one `key=value` attribute argument.
pub fn parse_attr(raw: &str) -> Result<(String, String), UsageError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(UsageError(format!("expected \"key=value\", got {raw:?}"))),
    }
}
