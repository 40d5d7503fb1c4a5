//! Implementation of `drover ctl`.

use crate::cli::CtlArgs;
use crate::config::Config;
use crate::control::ControlClient;
use crate::error::{ControlError, DroverError, Result};
use serde_json::Value;
use std::time::Duration;

/// Send one request and print the response as pretty JSON.
///
/// A response with `ok: false` is printed too, then reported as a failure.
pub fn cmd_ctl(args: CtlArgs) -> Result<()> {
    let request_args: Value = serde_json::from_str(&args.args)
        .map_err(|e| DroverError::UserError(format!("--args is not valid JSON: {}", e)))?;
    if !request_args.is_object() {
        return Err(DroverError::UserError(
            "--args must be a JSON object".to_string(),
        ));
    }
    if !args.timeout.is_finite() || args.timeout <= 0.0 {
        return Err(DroverError::UserError(
            "--timeout must be a positive number of seconds".to_string(),
        ));
    }

    let socket = match args.socket {
        Some(path) => path,
        None => Config::load_or_default(&args.config)?.socket_path(),
    };

    let response = ControlClient::new(&socket)
        .with_timeout(Duration::from_secs_f64(args.timeout))
        .request(&args.cmd, request_args)?;

    let rendered = serde_json::to_string_pretty(&response)
        .map_err(|e| DroverError::RuntimeError(format!("failed to render response: {}", e)))?;
    println!("{}", rendered);

    if response.ok {
        Ok(())
    } else {
        let reason = response.error.unwrap_or_else(|| "unknown error".to_string());
        Err(ControlError::Rejected(reason).into())
    }
}
