use clap::Parser;
use std::path::PathBuf;

mod acme;
mod config;
mod diagnostic_logging;
mod dns;
mod http_server;
mod lifecycle;
mod serve;
mod store;
mod tls_helpers;
mod token;

use diagnostic_logging::{DiagnosticFormat, LoggingConfig};

/// loopdns authoritative DNS and subdomain API daemon.
#[derive(Debug, Parser)]
#[command(about, version = version_info::loopdns_version())]
struct Opt {
    /// Configuration file to load.
    #[arg(long, default_value = "loopdnsd.yml")]
    config: PathBuf,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    register_panic_hook();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    LoggingConfig {
        filter_env_var: "LOOPDNSD_LOG",
        default_filter: "loopdnsd=info",
        diag_format: opts.diag_format,
    }
    .init()?;

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    let config = config::Config::load(&opts.config)?;
    tracing::info!(
        "loopdnsd {} authoritative for {}",
        version_info::loopdns_version(),
        config.root_domain
    );

    serve::serve(config).await
}

fn register_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let payload = payload.downcast_ref::<&str>().unwrap_or(&"!?");
        if let Some(loc) = info.location() {
            tracing::error!(
                "panic at {}:{}:{} - {}",
                loc.file(),
                loc.line(),
                loc.column(),
                payload
            );
        } else {
            tracing::error!("panic - {}", payload);
        }

        default_hook(info);
    }));
}
