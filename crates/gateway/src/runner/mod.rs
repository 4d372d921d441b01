//! Runner dispatch: routes exec/file/PTY requests to a user's connected
//! runner CLI, whether that runner's WebSocket landed on this pod or a
//! sibling one.

pub mod registry;
pub mod ws;
