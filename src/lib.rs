// src/lib.rs

// Real-time chat delivery for a marketplace backend.
//
// Clients hold one WebSocket each. Messages are persisted, fanned out to
// local connections by a pool of delivery workers, and relayed to other
// server processes over a shared broadcast bus. Presence and unread counts
// live in a shared key-value store so every process sees the same state.

pub mod backbone;
pub mod bus;
pub mod config;
pub mod delivery;
pub mod error;
pub mod ingest;
pub mod liveness;
pub mod models;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod rooms;
pub mod routes;
pub mod service;
pub mod session;
pub mod state;
pub mod store;
pub mod unread;
pub mod websocket;

pub use config::ChatConfig;
pub use error::{ChatError, ChatResult};
pub use service::ChatService;
pub use state::ChatState;
