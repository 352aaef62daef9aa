//! HTTP over the Wisp tunnel.
//!
//! [`TunnelManager`] is the entry point: it owns the TLS engine, keeps one
//! client per configured Wisp server and retries throttled requests.

mod client;
mod message;
mod manager;

pub use client::{
    BoxFuture, Connector, TunnelClient, TunnelClientConfig, Transport, WispConnector,
    MAX_REDIRECTS, USER_AGENT,
};
pub use message::{RedirectMode, Request, Response};
pub use manager::{RetryPolicy, TunnelManager};
