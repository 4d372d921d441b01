//! PTY session registry: keeps a terminal alive across browser
//! disconnects by buffering runner output until the browser reattaches
//! (or the session's TTL expires).

pub mod session;
pub mod ws;

pub use session::TerminalRegistry;
