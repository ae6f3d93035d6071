pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod filter;
pub mod import;
pub mod logging;
pub mod orchestrator;
pub mod persist;
pub mod postprocess;
pub mod ratelimit;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod transport;
