//! # opus-server
//!
//! Real-time WebSocket message gateway.
//!
//! A single [`Hub`](websocket::hub::Hub) task owns the session registry and
//! channel membership. Each connection runs a read pump that decodes frames
//! and hands them to the dispatcher, and a write pump that drains the
//! session's bounded outbound queue. The axum [`GatewayServer`] exposes
//! `/ws`, `/health` and `/metrics`.

#![deny(unsafe_code)]

pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use errors::{EnqueueError, FrameError, GatewayError};
pub use server::GatewayServer;
pub use websocket::frame::Frame;
pub use websocket::hub::{HubHandle, HubStats};
