//! Entry point for running one or both proxy halves in a single process, per `global.type`. In
//! the `both` case the two halves are wired together over a real loopback connection between
//! `external.internal` and `internal.bind` -- no special-cased combined code path, just both
//! halves of the link running concurrently in the same process.

use longhaul::config::GlobalType;
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

    let result = runtime.block_on(async move {
        match config.global.r#type {
            GlobalType::External => longhaul::external::run(config).await,
            GlobalType::Internal => longhaul::internal::run(config).await,
            GlobalType::Both => {
                let internal_config = config.clone();
                tokio::try_join!(longhaul::external::run(config), longhaul::internal::run(internal_config),)
                    .map(|((), ())| ())
            }
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "proxy exited with an error");
            ExitCode::FAILURE
        }
    }
}
