//! ringws-server — the WebSocket server runtime on the ringws transport.
//!
//! Worker threads own the sockets: an edge-triggered epoll loop drives each
//! peer through TCP, optional TLS, the HTTP upgrade, and WebSocket framing,
//! publishing decoded messages onto per-app inbound rings. App threads own
//! the logic: user callbacks consume inbound events and answer through
//! fan-out send primitives that frame a message once per target worker's
//! outbound ring. Nothing is shared but the rings.
//!
//! # Example
//!
//! ```no_run
//! use ringws_server::{AppCtx, AppHandler, Server, ServerConfig};
//! use ringws::IoResult;
//!
//! struct Echo;
//!
//! impl AppHandler for Echo {
//!     fn on_message(&mut self, ctx: &mut AppCtx<'_>, payload: &[u8], is_utf8: bool) -> IoResult {
//!         ctx.to_cur(is_utf8, payload)
//!     }
//! }
//!
//! fn main() -> IoResult {
//!     let mut server = Server::new(ServerConfig::default());
//!     server.register_app("echo", "/echo", Echo);
//!     server.run()
//! }
//! ```

mod app;
mod config;
mod http;
mod peer;
mod server;
mod tcp;
mod tls;
mod worker;
mod ws;

pub use app::{AppCtx, AppHandler, AppRuntime};
pub use config::ServerConfig;
pub use http::{accept_key, Endpoint};
pub use peer::{Layer, Mortality, Peer};
pub use server::Server;
pub use worker::{InboundPublisher, Worker};

// The app-facing half of the transport's vocabulary, re-exported so app
// crates need only one dependency.
pub use ringws::{ClientId, IoErr, IoResult};
