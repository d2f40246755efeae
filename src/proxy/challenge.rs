//! HTTP-01 challenge responder: serves
//! `/.well-known/acme-challenge/<token>` on port 80.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::RwLock;
use tracing::info;

/// `token -> key authorization`, populated by the ACME client for the
/// duration of an order and cleaned up on completion.
#[derive(Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, token: impl Into<String>, key_authorization: impl Into<String>) {
        self.tokens.write().await.insert(token.into(), key_authorization.into());
    }

    pub async fn retract(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    async fn lookup(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }
}

pub fn router(store: ChallengeStore) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(respond))
        .with_state(store)
}

async fn respond(State(store): State<ChallengeStore>, Path(token): Path<String>) -> impl IntoResponse {
    match store.lookup(&token).await {
        Some(key_authorization) => {
            info!(%token, status = 200, "acme-challenge request");
            (StatusCode::OK, key_authorization).into_response()
        }
        None => {
            info!(%token, status = 404, "acme-challenge request");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_retract() {
        let store = ChallengeStore::new();
        store.publish("tok1", "auth1").await;
        assert_eq!(store.lookup("tok1").await, Some("auth1".to_string()));
        store.retract("tok1").await;
        assert_eq!(store.lookup("tok1").await, None);
    }

    #[tokio::test]
    async fn unknown_token_is_none() {
        let store = ChallengeStore::new();
        assert_eq!(store.lookup("missing").await, None);
    }
}
