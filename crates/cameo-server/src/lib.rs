//! # cameo-server - Application Registry and Lifecycle
//!
//! Tracks live application instances, drives their lifecycle, and publishes
//! every state change on one ordered event stream.
//!
//! Depends on [`cameo_core`] for the wire protocol, transports and errors.
//!
//! ## Public API
//!
//! ### Running a Server
//! - [`ServerHandle`] - Bind the request and event endpoints and serve requests
//! - [`ServerConfig`], [`load_config()`] - TOML configuration
//!
//! ### Registry
//! - [`Registry`] - Authoritative instance map; every mutation is broadcast under one lock
//! - [`IdAllocator`], [`PortAllocator`] - Bounded id and port pools
//! - [`EventPublisher`] - Ordered outbound event stream
//!
//! ### Lifecycle
//! - [`Manager`] - Starts instances and supervises each one in its own task
//! - [`Launcher`], [`ProcessHandle`] - Process collaborator
//! - [`RequestProcessor`] - Maps requests onto the manager and registry

pub mod allocator;
pub mod config;
pub mod manager;
pub mod process;
pub mod processor;
pub mod publisher;
pub mod registry;
pub mod server;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

pub use allocator::{IdAllocator, PortAllocator, MAX_ID};
pub use config::{load_config, load_config_or_default, ApplicationConfig, ServerConfig, ServerSettings};
pub use manager::Manager;
pub use process::{CommandLauncher, ExitReporter, LaunchSpec, Launcher, ProcessHandle};
pub use processor::RequestProcessor;
pub use publisher::EventPublisher;
pub use registry::{Registry, StopRequest};
pub use server::ServerHandle;
