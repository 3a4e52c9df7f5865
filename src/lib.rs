pub mod annotations;
pub mod app;
pub mod config;
pub mod gateway;
pub mod indices;
pub mod reconciler;
pub mod signal;
pub mod trace;
pub mod watcher;

#[macro_use]
extern crate tracing;

#[macro_use]
extern crate metrics;

/// Reflector's basic error type, dynamically dispatched and safe to send
/// across threads
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Reflector's basic result type, defined in terms of [`Error`] and generic over `T`
pub type Result<T> = std::result::Result<T, Error>;
