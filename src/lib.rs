//! netfwd
//!
//! A general-purpose TCP forwarder. Accepts inbound connections, connects to a
//! remote address and relays bytes between the two, optionally terminating TLS
//! on the inbound side and/or originating TLS on the outbound side.

pub mod cli;
pub mod config;
pub mod proxy;
pub mod relay;
pub mod stream;
pub mod tls;

// Re-export commonly used types and functions
pub use cli::Cli;
pub use config::{Config, InboundTls, Options, OutboundTls, TrustPolicy, load_config};
pub use proxy::{Forwarder, handle_connection, run, serve};
pub use relay::{BUFFER_SIZE, Direction, RelayHandle, Tee, WriterTee};
pub use stream::{InboundStream, StreamType};
pub use tls::{load_client_config, load_server_config};
