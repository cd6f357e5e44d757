//! Entry point for the server-facing "internal" proxy.

use std::process::ExitCode;
use tracing_subscriber::prelude::*;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match longhaul::Config::read(None) {
        Ok(config) => config,
        Err(longhaul::ConfigError::TemplateWritten(path)) => {
            tracing::info!(path, "no configuration found, wrote a template -- fill it in and restart");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(longhaul::internal::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "internal proxy exited with an error");
            ExitCode::FAILURE
        }
    }
}
