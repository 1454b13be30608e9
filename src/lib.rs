#![deny(clippy::all)]
#![forbid(unsafe_code)]

//! bastiond is an auditing SSH bastion relay.
//!
//! Users connect to the bastion with a regular SSH client, authenticate
//! against a local policy and pick a backend host from an interactive
//! selector bounded by their access-control list. The bastion then dials a
//! second SSH connection to the chosen target and relays the two sessions,
//! recording every byte and channel request on the way. Pressing Ctrl-T
//! inside a relayed session drops into an in-band file-transfer prompt that
//! moves files through the bastion's per-user staging directory, with MD5
//! integrity checks on both directions.
//!
//! It runs on top of the Tokio asynchronous run-time and uses
//! [russh](https://crates.io/crates/russh) for both sides of the relay.
//!
//! # Quick Start
//!
//! ```no_run
//! #[tokio::main]
//! pub async fn main() {
//!     let config = bastiond::config::Config::load("config.yaml").unwrap();
//!     let server = bastiond::Server::with_config(std::sync::Arc::new(config)).build().unwrap();
//!
//!     server.listen().await.unwrap();
//! }
//! ```

pub mod audit;
pub mod auth;
pub mod config;
pub(crate) mod server;
pub mod transfer;
pub mod vfs;

pub use crate::server::{Server, ServerBuilder, error::ServerError};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
