//! Session lifecycle management for courier protocol clients.
//!
//! Provides:
//! - `SessionManager` - Cache, refresh and tear down per-identity sessions
//! - `SessionEvent` - Lifecycle notifications
//! - Store implementations (memory)

pub mod events;
pub mod manager;
pub mod storage;

pub use events::{EventBus, SessionEvent};
pub use manager::{SessionError, SessionManager};
