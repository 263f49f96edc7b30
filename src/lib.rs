// Chat Relay - asynchronous streaming job engine for LLM chat

pub mod config;
pub mod models;
pub mod types;
pub mod llm;
pub mod storage;
pub mod routes;
pub mod middleware;
pub mod queue;   // Job store, event bus, executor and stream relay
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;
pub use queue::JobService;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
