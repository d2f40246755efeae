//! Fingerprint-based deploy skip: a
//! deterministic hash over everything that would cause a redeploy, so a
//! repeated invocation with unchanged inputs is a no-op.
//!
//! Grounded on the state store's own use of `sha2` for certificate-file
//! content checks (`proxy/state.rs`) — same crate, same "hash the
//! canonicalized inputs" idiom, applied here to deploy inputs instead of
//! certificate bytes.

use sha2::{Digest, Sha256};

use crate::model::{App, Env, HealthSpec, PortSpec, ProxySpec, Service, VolumeSpec};

/// Hash over everything spec §4.G names: "(image-or-build-context-id,
/// sorted env plain, sorted secret values, ports, volumes, proxy spec,
/// health spec, replicas)". Secret values are included so a secret
/// rotation triggers a redeploy; secret *names* are not, matching the
/// spec's literal phrasing.
pub fn fingerprint(
    image_ref: &str,
    env: &Env,
    ports: &[PortSpec],
    volumes: &[VolumeSpec],
    proxy: Option<&ProxySpec>,
    health: &HealthSpec,
    replicas: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_ref.as_bytes());
    hasher.update(b"\0");

    for (key, value) in env.plain.iter() {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }

    let mut secret_values: Vec<&String> = env.secret.values().collect();
    secret_values.sort();
    for value in secret_values {
        hasher.update(value.as_bytes());
        hasher.update(b"\0");
    }

    let mut sorted_ports = ports.to_vec();
    sorted_ports.sort();
    for port in &sorted_ports {
        hasher.update(format!("{}:{}/{}\0", port.host_port, port.container_port, port.protocol).as_bytes());
    }

    let mut sorted_volumes = volumes.to_vec();
    sorted_volumes.sort();
    for volume in &sorted_volumes {
        hasher.update(format!("{}:{}\0", volume.host_path, volume.container_path).as_bytes());
    }

    if let Some(proxy) = proxy {
        hasher.update(
            format!(
                "{}|{}|{}|{}|{}|{}\0",
                proxy.hostnames.join(","),
                proxy.backend_port,
                proxy.ssl,
                proxy.ssl_redirect,
                proxy.response_timeout_secs,
                proxy.forward_headers,
            )
            .as_bytes(),
        );
    }

    hasher.update(health.path.as_bytes());
    hasher.update(b"\0");
    hasher.update(replicas.to_le_bytes());

    format!("{:x}", hasher.finalize())
}

/// Fingerprint for a blue-green `App` deploy.
pub fn app_fingerprint(app: &App, image_ref: &str) -> String {
    fingerprint(
        image_ref,
        &app.env,
        &[],
        &[],
        Some(&app.proxy),
        &app.health,
        app.replicas,
    )
}

/// Fingerprint for a `Service` deploy (blue-green or stop-start alike).
pub fn service_fingerprint(service: &Service, image_ref: &str) -> String {
    fingerprint(
        image_ref,
        &service.env,
        &service.ports,
        &service.volumes,
        service.proxy.as_ref(),
        &service.health,
        service.replicas,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn env(plain: &[(&str, &str)]) -> Env {
        Env {
            plain: plain.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            secret: BTreeMap::new(),
        }
    }

    #[test]
    fn identical_inputs_hash_identically() {
        let health = HealthSpec::default();
        let a = fingerprint("img:rel", &env(&[("A", "1")]), &[], &[], None, &health, 1);
        let b = fingerprint("img:rel", &env(&[("A", "1")]), &[], &[], None, &health, 1);
        assert_eq!(a, b);
    }

    #[test]
    fn changing_env_changes_hash() {
        let health = HealthSpec::default();
        let a = fingerprint("img:rel", &env(&[("A", "1")]), &[], &[], None, &health, 1);
        let b = fingerprint("img:rel", &env(&[("A", "2")]), &[], &[], None, &health, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn env_key_order_does_not_matter() {
        let health = HealthSpec::default();
        let a = fingerprint("img:rel", &env(&[("A", "1"), ("B", "2")]), &[], &[], None, &health, 1);
        let b = fingerprint("img:rel", &env(&[("B", "2"), ("A", "1")]), &[], &[], None, &health, 1);
        assert_eq!(a, b);
    }
}
