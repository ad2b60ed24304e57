use clap::ValueEnum;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig {
    pub filter_env_var: &'static str,
    pub default_filter: &'static str,
    pub diag_format: DiagnosticFormat,
}

impl LoggingConfig {
    pub fn init(&self) -> anyhow::Result<()> {
        let layer = fmt::layer()
            .with_thread_names(true)
            .with_writer(std::io::stderr);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let env_filter = EnvFilter::try_new(
            std::env::var(self.filter_env_var)
                .as_deref()
                .unwrap_or(self.default_filter),
        )?;

        tracing_subscriber::registry()
            .with(layer.with_filter(env_filter))
            .init();
        Ok(())
    }
}
