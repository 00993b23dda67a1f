// lib.rs - Library root. The binary in main.rs, the integration tests and
// the benchmarks all build on these modules.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod loader;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
pub mod workspace;

pub use cache::GlobalCache;
pub use cancel::{CancellationRegistry, Cancelled, RequestScope};
pub use config::{Config, ServerOptions};
pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use session::Session;
