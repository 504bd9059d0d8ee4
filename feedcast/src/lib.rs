//! Store-and-forward feed distribution node
//!
//! Wires the spool, the delivery scheduler and the provisioning file together
//! behind a single [`controller::Node`].

pub mod config;
pub mod controller;
pub mod provisioning;

pub use config::NodeConfig;
pub use controller::{Node, run};
