//! The bridge: chat-text command routing and response correlation.

mod router;
mod watcher;

pub use router::BridgeRouter;
pub use watcher::ResponseWatcher;
