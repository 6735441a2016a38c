//! Terminal execution: named sessions, each owning at most one shell command.

mod registry;
mod session;

pub use registry::SessionRegistry;
pub use session::TerminalSession;
