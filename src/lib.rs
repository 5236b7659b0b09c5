//! Peerlink - process registry for multi-process servers
//!
//! A deployment is a set of processes, each serving an RPC server under a
//! configured server id. Every process keeps one supervised connection per
//! peer, binds the service modules those peers provide, stops its own copy
//! of a singleton module when a peer already runs it, and relays locally
//! published events to its peers.
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerlink::config::Config;
//! use peerlink::services::EchoModule;
//! use peerlink::ProcessContext;
//!
//! # async fn run() -> peerlink::Result<()> {
//! let config = Config::load(Some("peerlink.yaml")).expect("config");
//! let ctx = ProcessContext::builder(config)
//!     .module(Arc::new(EchoModule::new()))
//!     .build();
//! ctx.serve("rpc-1").await?;
//! ctx.connect_all(true).await?;
//! # Ok(())
//! # }
//! ```

pub mod arbitration;
pub mod bus;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod proto;
pub mod registry;
pub mod schedule;
pub mod services;
pub mod transport;
pub mod utils;

#[cfg(test)]
pub mod test_utils;

pub use context::{ProcessContext, ProcessContextBuilder};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleHooks, NoopHooks};
