//! `iop-proxy` entry point: binds the three listeners and spawns
//! the background workers (snapshot writer, ACME acquisition/renewal,
//! health checker, SNI certificate refresh).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use iop::proxy::acme::{spawn_acquisition_worker, spawn_renewal_worker, AcmeClient, FailureBudget};
use iop::proxy::challenge::ChallengeStore;
use iop::proxy::router::{RouterContext, UpstreamCache};
use iop::proxy::settings::ProxySettings;
use iop::proxy::state::StateStore;
use iop::proxy::{api, health, router, tls};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("installing default rustls crypto provider"))?;

    let config_path = std::env::args().nth(1);
    let settings = ProxySettings::load(config_path.as_deref()).context("loading proxy settings")?;

    let snapshot_path = settings.snapshot_path();
    let state = Arc::new(
        StateStore::load(snapshot_path)
            .await
            .context("loading state snapshot")?,
    );
    state.clone().spawn_snapshot_writer(settings.snapshot_interval_secs);

    let challenges = ChallengeStore::new();
    let accounts_dir = settings.certs_dir().join("accounts");
    let acme_client = Arc::new(AcmeClient::new(accounts_dir, challenges.clone()));
    let acme_budget = Arc::new(FailureBudget::new(settings.acme.hourly_failure_budget));

    spawn_acquisition_worker(
        state.clone(),
        acme_client.clone(),
        settings.acme.clone(),
        acme_budget.clone(),
        settings.certs_dir(),
    );
    spawn_renewal_worker(state.clone(), settings.acme.renewal_scan_interval_secs);
    health::spawn(state.clone(), settings.health_check.clone());

    let cert_resolver = tls::CertResolver::new();
    cert_resolver
        .clone()
        .spawn_refresh_loop(state.clone(), settings.health_check.interval_secs);
    let tls_config = tls::server_config(cert_resolver.clone());

    let upstreams = Arc::new(UpstreamCache::new());
    let router_ctx = RouterContext {
        state: state.clone(),
        upstreams,
        https_port: settings.https_port,
    };

    let http_addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let https_addr = SocketAddr::from(([0, 0, 0, 0], settings.https_port));
    let management_addr = SocketAddr::from(([127, 0, 0, 1], settings.management_port));

    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {http_addr}"))?;
    let https_listener = TcpListener::bind(https_addr)
        .await
        .with_context(|| format!("binding HTTPS listener on {https_addr}"))?;
    let management_listener = TcpListener::bind(management_addr)
        .await
        .with_context(|| format!("binding management API listener on {management_addr}"))?;

    info!(%http_addr, %https_addr, %management_addr, "iop-proxy listening");

    let http_router = router::http_router(router_ctx.clone(), challenges);
    let management_router = api::router(api::ApiContext {
        state: state.clone(),
        acme_budget,
        certs_dir: settings.certs_dir(),
        cert_resolver: cert_resolver.clone(),
    });

    let http_server = axum::serve(
        http_listener,
        http_router.into_make_service_with_connect_info::<SocketAddr>(),
    );
    let https_server = tls::serve_https(https_listener, tls_config, router_ctx);
    let management_server = axum::serve(
        management_listener,
        management_router.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        res = http_server => res.context("HTTP listener exited")?,
        res = https_server => res.context("HTTPS listener exited")?,
        res = management_server => res.context("management API listener exited")?,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, flushing state snapshot");
            state.flush().await.ok();
        }
    }

    Ok(())
}
