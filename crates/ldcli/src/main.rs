use clap::{Parser, Subcommand};
use url::Url;

mod proxy;
mod state;

const DEFAULT_ENDPOINT: &str = "https://v1.dyn.direct/";

/// loopdns command line tool.
#[derive(Debug, Parser)]
#[command(name = "ldcli", about, version = version_info::loopdns_version())]
struct Opt {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a HTTPS proxy in front of a local destination.
    Proxy {
        /// Port to serve HTTPS on (bound to 127.0.0.1).
        src_port: u16,

        /// Destination URL requests are forwarded to.
        dst_url: String,

        /// Overwrite the Host header with the destination's host.
        #[arg(long)]
        override_host: bool,

        /// Replace the stored subdomain and certificate.
        #[arg(long)]
        replace: bool,

        /// API endpoint of the issuing server.
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: Url,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LDCLI_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ldcli=info")),
        )
        .init();

    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    match opts.command {
        Command::Proxy {
            src_port,
            dst_url,
            override_host,
            replace,
            endpoint,
        } => {
            proxy::run(proxy::ProxyOptions {
                src_port,
                dst_url,
                override_host,
                replace,
                endpoint,
            })
            .await
        }
    }
}
