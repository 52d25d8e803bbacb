//! WebSocket gateway core: frames, sessions, hub, dispatch and pumps.

pub mod dispatcher;
pub mod frame;
pub mod hub;
pub mod pump;
pub mod session;
