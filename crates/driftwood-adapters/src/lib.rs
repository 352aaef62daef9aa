//! Runtime adapters for Driftwood (Wisp tunnel, TLS engine, settings, API session).

pub mod engine;
pub mod error;
pub mod session;
pub mod settings;
pub mod tunnel;
pub mod wisp;

pub use error::{ErrorKind, TunnelError};
pub use session::Session;
pub use settings::{Settings, SharedSettings};
pub use tunnel::{RedirectMode, Request, Response, RetryPolicy, TunnelManager};
