//! HTTP gateway surface (§5): a thin axum binding over the engine modules in `crate::airborne`.
//!
//! Mirrors the teacher's own preference for a handful of explicit handlers over a generated
//! router layer — one route per RPC named in the external interfaces, no middleware stack
//! beyond what `AuthMiddleware` already does. The admin dashboard and TLS termination in front
//! of this are external collaborators; this module only binds the chat/RAG/health surface.

pub mod routes;

use crate::airborne::auth::AuthMiddleware;
use crate::airborne::keys::KeyRepository;
use crate::airborne::orchestrator::ChatOrchestrator;
use crate::airborne::rate_limit::CounterBackend;
use axum::Router;
use std::sync::Arc;

/// Shared state handed to every handler. Generic over the same two collaborator traits as
/// `AuthMiddleware`/`ChatOrchestrator` so the binary can wire Redis-backed or in-memory
/// implementations without the router caring which.
pub struct AppState<R: KeyRepository + Send + Sync + 'static, B: CounterBackend + Send + Sync + 'static> {
    pub auth: Arc<AuthMiddleware<R, B>>,
    pub orchestrator: Arc<ChatOrchestrator<B>>,
}

impl<R: KeyRepository + Send + Sync + 'static, B: CounterBackend + Send + Sync + 'static> Clone for AppState<R, B> {
    fn clone(&self) -> Self {
        AppState { auth: self.auth.clone(), orchestrator: self.orchestrator.clone() }
    }
}

pub fn build_router<R, B>(state: AppState<R, B>) -> Router
where
    R: KeyRepository + Send + Sync + 'static,
    B: CounterBackend + Send + Sync + 'static,
{
    Router::new()
        .route("/v1/health", axum::routing::get(routes::health))
        .route("/v1/version", axum::routing::get(routes::version))
        .route("/v1/chat", axum::routing::post(routes::chat::<R, B>))
        .route("/v1/chat/stream", axum::routing::post(routes::chat_stream::<R, B>))
        .route("/v1/rag/ingest", axum::routing::post(routes::rag_ingest::<R, B>))
        .route("/v1/rag/retrieve", axum::routing::post(routes::rag_retrieve::<R, B>))
        .route(
            "/v1/file-search-store/upload",
            axum::routing::post(routes::file_search_store_upload::<R, B>),
        )
        .with_state(Arc::new(state))
}
