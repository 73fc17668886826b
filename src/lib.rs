//! # cameo - Server and Console
//!
//! The `cameo` binary either runs a server (`cameo server`) or performs a
//! single console command against a running one.
//!
//! ## Crates
//!
//! - [`cameo_core`] - Wire protocol, transports, state model, errors, logging
//! - [`cameo_server`] - Registry, process launching, config and the request loop
//! - [`cameo_client`] - Instances, waits, key/values and communication objects
//!
//! ## Public API
//!
//! - [`console`] - Console commands and their output formatting

pub mod console;
