//! ACME client: acquires and renews certificates via the
//! HTTP-01 challenge, backed by `instant-acme` (the crate
//! `server/domain/acme_service.rs` already imports, adapted here from its
//! DNS-01 flow to HTTP-01 since there is no DNS provider abstraction in
//! scope for a single self-hosted proxy).

mod budget;
mod client;
mod worker;

pub use budget::FailureBudget;
pub use client::{write_certificate_files, AcmeClient};
pub use worker::{spawn_acquisition_worker, spawn_renewal_worker};
