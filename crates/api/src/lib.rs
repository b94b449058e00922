//! Herald server: WebSocket delivery endpoint, connection registry, and the
//! health / feed status API.

pub mod message;
pub mod registry;
pub mod routes;
pub mod state;
