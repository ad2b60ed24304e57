use crate::acme::AcmeManager;
use crate::config::{Config, StoreKind};
use crate::dns::DnsHandler;
use crate::http_server::{make_api_router, make_redirect_router, AppState};
use crate::lifecycle::{LifeCycle, ShutdownSubscription};
use crate::store::{MemStore, RedisStore, Store, MAX_ENTRIES};
use crate::token::TokenAuthority;
use anyhow::Context;
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

const DNS_LISTEN: &str = "0.0.0.0:53";

/// Bring up the DNS, API and redirect listeners and supervise them:
/// the first listener to fail takes the whole group down, and a
/// termination signal shuts everything down cooperatively.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let mut life_cycle = LifeCycle::new();

    let mut mem_store = None;
    let store: Arc<dyn Store> = match config.store {
        StoreKind::Mem => {
            let store = Arc::new(MemStore::new(
                MAX_ENTRIES,
                PathBuf::from("cache/stats.json"),
            ));
            mem_store = Some(Arc::clone(&store));
            store
        }
        StoreKind::Redis => Arc::new(RedisStore::connect(&config).await?),
    };

    let authority = TokenAuthority::new(config.token_key.as_bytes());
    let handler = Arc::new(DnsHandler::new(
        config.root_domain.clone(),
        config.static_records.clone(),
        Arc::clone(&store),
    ));
    let api_router = make_api_router(
        AppState {
            authority,
            store: Arc::clone(&store),
            root_domain: Arc::new(config.root_domain.clone()),
        },
        config.api_behind_proxy,
    );

    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let dns_socket = UdpSocket::bind(DNS_LISTEN)
        .await
        .with_context(|| format!("listen on udp {DNS_LISTEN}"))?;
    tracing::info!("dns listener on {DNS_LISTEN}");
    tasks.spawn(crate::dns::serve_udp(
        handler,
        dns_socket,
        ShutdownSubscription::get(),
    ));

    if let Some(store) = mem_store {
        tasks.spawn(async move {
            store.run_cleaner(ShutdownSubscription::get()).await;
            Ok(())
        });
    }

    let api_host = Arc::new(config.api_host().to_string());

    match &config.api_listen_https {
        Some(https_listen) => {
            let use_static_pair = config.tls_cert.is_some() && config.tls_key.is_some();
            let acme = if config.acme_enabled && !use_static_pair {
                Some(Arc::new(AcmeManager::new(
                    api_host.to_string(),
                    config.acme_contact.clone(),
                    PathBuf::from("cache"),
                )))
            } else {
                None
            };

            let tls = match &acme {
                Some(manager) => manager.initial_tls_config().await?,
                None => RustlsConfig::from_config(
                    crate::tls_helpers::make_server_config(
                        &api_host,
                        &config.tls_key,
                        &config.tls_cert,
                    )
                    .await?,
                ),
            };

            let https_socket = std::net::TcpListener::bind(https_listen)
                .with_context(|| format!("listen on {https_listen}"))?;
            let https_addr = https_socket.local_addr()?;
            tracing::info!("https listener on {https_addr}");
            let https_server = axum_server::from_tcp_rustls(https_socket, tls.clone());
            tasks.spawn(async move {
                https_server
                    .serve(api_router.into_make_service_with_connect_info::<SocketAddr>())
                    .await
                    .context("https listener")
            });

            let redirect_router = make_redirect_router(Arc::clone(&api_host), acme.clone());
            let http_socket = std::net::TcpListener::bind(&config.api_listen_http)
                .with_context(|| format!("listen on {}", config.api_listen_http))?;
            let http_addr = http_socket.local_addr()?;
            tracing::info!("http redirect listener on {http_addr}");
            let http_server = axum_server::from_tcp(http_socket);
            tasks.spawn(async move {
                http_server
                    .serve(redirect_router.into_make_service())
                    .await
                    .context("http redirect listener")
            });

            if let Some(manager) = acme {
                tasks.spawn(async move {
                    manager.run_renewal(tls, ShutdownSubscription::get()).await;
                    Ok(())
                });
            }
        }
        None => {
            let http_socket = std::net::TcpListener::bind(&config.api_listen_http)
                .with_context(|| format!("listen on {}", config.api_listen_http))?;
            let http_addr = http_socket.local_addr()?;
            tracing::info!("http listener on {http_addr}");
            let http_server = axum_server::from_tcp(http_socket);
            tasks.spawn(async move {
                http_server
                    .serve(api_router.into_make_service_with_connect_info::<SocketAddr>())
                    .await
                    .context("http listener")
            });
        }
    }

    enum Exit {
        Task(anyhow::Result<()>),
        Signal,
    }

    let exit = tokio::select! {
        joined = tasks.join_next() => Exit::Task(match joined {
            Some(Ok(result)) => result,
            Some(Err(join_err)) => Err(anyhow::anyhow!("listener task failed: {join_err}")),
            None => Ok(()),
        }),
        _ = life_cycle.wait_for_shutdown() => Exit::Signal,
    };

    match exit {
        Exit::Signal => {
            tasks.shutdown().await;
            Ok(())
        }
        Exit::Task(result) => {
            // The first listener to exit takes the group down.
            if let Err(err) = &result {
                tracing::error!("listener failed, shutting down: {err:#}");
            }
            LifeCycle::request_shutdown().await;
            life_cycle.wait_for_shutdown().await;
            tasks.shutdown().await;
            result
        }
    }
}
