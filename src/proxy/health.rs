//! Health Checker: periodically probes each routing entry's
//! target and records pass/fail, gating the router.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::proxy::settings::HealthCheckSettings;
use crate::proxy::state::StateStore;

/// Spawns the background health-check loop.
pub fn spawn(state: Arc<StateStore>, settings: HealthCheckSettings) {
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .expect("building health-check HTTP client");

        let mut ticker = tokio::time::interval(Duration::from_secs(settings.interval_secs));
        loop {
            ticker.tick().await;
            let entries = state.list(None).await;
            for entry in entries {
                let healthy = probe(&client, &entry.target, &entry.health_path).await;
                if let Err(e) = state.update_health(&entry.hostname, healthy).await {
                    warn!(hostname = %entry.hostname, error = %e, "failed to record health check result");
                }
            }
        }
    });
}

async fn probe(client: &reqwest::Client, target: &str, health_path: &str) -> bool {
    let url = format!("http://{target}{health_path}");
    match client.get(&url).send().await {
        Ok(resp) => {
            let ok = (StatusCode::OK.as_u16()..StatusCode::MULTIPLE_CHOICES.as_u16())
                .contains(&resp.status().as_u16());
            debug!(url, status = %resp.status(), healthy = ok, "health check");
            ok
        }
        Err(e) => {
            debug!(url, error = %e, "health check failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_fails_against_unreachable_target() {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let healthy = probe(&client, "127.0.0.1:1", "/up").await;
        assert!(!healthy);
    }
}
