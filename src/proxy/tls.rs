//! TLS termination: a custom
//! `rustls::ServerConfig` with per-hostname SNI certificate resolution, and
//! a manual `hyper`/`tokio-rustls` accept loop serving the axum `Router` as
//! a `tower::Service` — there is no `axum-server` dependency here, so
//! connections are served the same way the low-level hyper examples in the
//! `hyper-util`/`http-body-util` docs do it.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, SystemTime};

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, warn};

use crate::model::CertificateState;
use crate::proxy::router::RouterContext;
use crate::proxy::state::StateStore;

struct CachedCert {
    mtime: SystemTime,
    key: Arc<CertifiedKey>,
}

/// Resolves the SNI certificate for each handshake from an in-memory cache
/// kept current by [`CertResolver::spawn_refresh_loop`]. `resolve` is a
/// synchronous rustls callback, so it cannot itself await the state
/// store — the refresh loop is what makes certificate loading effectively
/// lazy (a newly-Active certificate shows up within one refresh tick
/// instead of on the next process restart).
pub struct CertResolver {
    cache: StdRwLock<std::collections::HashMap<String, CachedCert>>,
}

impl CertResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            cache: StdRwLock::new(std::collections::HashMap::new()),
        })
    }

    pub fn spawn_refresh_loop(self: Arc<Self>, state: Arc<StateStore>, interval_secs: u64) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                self.refresh(&state).await;
            }
        });
    }

    async fn refresh(&self, state: &StateStore) {
        for entry in state.list(None).await {
            let Some(cert) = entry.certificate else { continue };
            if cert.state != CertificateState::Active {
                continue;
            }
            let (Some(cert_file), Some(key_file)) = (cert.cert_file, cert.key_file) else {
                continue;
            };
            if let Err(e) = self.load_if_changed(&entry.hostname, &cert_file, &key_file) {
                warn!(hostname = %entry.hostname, error = %e, "failed to load certificate for SNI resolver");
            }
        }
    }

    fn load_if_changed(&self, hostname: &str, cert_path: &str, key_path: &str) -> anyhow::Result<()> {
        let mtime = std::fs::metadata(cert_path)?.modified()?;
        {
            let cache = self.cache.read().expect("cert resolver cache lock poisoned");
            if let Some(existing) = cache.get(hostname) {
                if existing.mtime == mtime {
                    return Ok(());
                }
            }
        }

        let cert_bytes = std::fs::read(cert_path)?;
        let key_bytes = std::fs::read(key_path)?;
        let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
            .collect::<Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())?
            .ok_or_else(|| anyhow::anyhow!("no private key found in {key_path}"))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        let certified = CertifiedKey::new(certs, signing_key);

        self.cache
            .write()
            .expect("cert resolver cache lock poisoned")
            .insert(hostname.to_string(), CachedCert { mtime, key: Arc::new(certified) });
        debug!(hostname, "SNI certificate (re)loaded");
        Ok(())
    }

    /// Drop a hostname's cached certificate, e.g. once its routing entry
    /// (and the certificate files backing it) have been removed.
    pub fn evict(&self, hostname: &str) {
        self.cache
            .write()
            .expect("cert resolver cache lock poisoned")
            .remove(hostname);
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.cache.read().ok()?.get(sni).map(|c| c.key.clone())
    }
}

/// TLS 1.2 minimum, explicit cipher suites rather than rustls's
/// full default list.
pub fn server_config(resolver: Arc<CertResolver>) -> Arc<rustls::ServerConfig> {
    let suites = vec![
        rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
        rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        rustls::crypto::ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        rustls::crypto::ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    ];
    let provider = Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: suites,
        ..rustls::crypto::ring::default_provider()
    });

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .expect("selecting TLS protocol versions")
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Accept loop for the HTTPS listener: terminate TLS, then hand the
/// decrypted connection to the axum router via the low-level hyper/
/// hyper-util stack (no `axum-server`).
pub async fn serve_https(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    ctx: RouterContext,
) -> std::io::Result<()> {
    let acceptor = TlsAcceptor::from(tls_config);
    let router = crate::proxy::router::https_router(ctx);

    loop {
        let (tcp_stream, peer_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let router = router.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!(%peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = TokioIo::new(tls_stream);
            let svc = tower::service_fn(move |mut req: axum::extract::Request| {
                req.extensions_mut().insert(axum::extract::ConnectInfo(peer_addr));
                let mut router = router.clone();
                async move { router.call(req).await }
            });

            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, TowerToHyperService::new(svc))
                .await
            {
                debug!(%peer_addr, error = %e, "HTTPS connection closed with error");
            }
        });
    }
}

