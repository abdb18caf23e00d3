//! # tapestry
//!
//! A streaming HTML fragment-composition server on a from-scratch async
//! HTTP/1.1 core.
//!
//! A request for `/<route>` is resolved to a [`Template`](template::Template):
//! literal HTML interleaved with named slots. Every slot is fetched
//! concurrently from an upstream fragment server, and the page is streamed
//! back in template order as soon as each piece is ready. Slots have their own
//! timeouts; optional slots fall back to static HTML and a failing required
//! slot fails the whole page.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tapestry::config::Config;
//! use tapestry::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("tapestry.json")?;
//!     let app = config.composition_server()?;
//!     let server = Server::bind(&config.layout.listen).await?;
//!     app.run(server).await?;
//!     Ok(())
//! }
//! ```

pub mod compose;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod fragments;
pub mod http;
pub mod layout;
pub mod router;
pub mod server;
pub mod template;

pub use compose::{Composer, Composition, CompositionRequest};
pub use error::{CompositionFailure, ConfigError, FetchError, RouteNotFound};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use layout::CompositionServer;
pub use router::Router;
pub use server::{Server, ServerError};
