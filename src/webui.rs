//! HTTP/JSON and WebSocket surface over the service manager.

pub mod access_log;
pub mod health;
pub mod routes;
pub mod server;
pub mod websocket;

pub use routes::AppState;
pub use server::start_server;
