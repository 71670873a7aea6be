//! # svcctl
//!
//! Integration-test service controller: a per-test-invocation daemon
//! that manages the lifecycle of the external processes a test needs,
//! plus the client library for talking to it.
//!
//! ## Pieces
//!
//! - [`controller::Controller`] holds the service registry and drives
//!   starts in dependency order and stops in reverse.
//! - [`service::Service`] is the per-service lifecycle record: process
//!   supervision, health checking, restart detection, sanitizer-log
//!   capture.
//! - [`server`] / [`client`] speak a framed binary protocol over a
//!   localhost TCP port published in the test scratch directory.
//! - The `svcinit` binary wraps a test binary: it brings the daemon
//!   up, registers definitions, gates the test on service health,
//!   tears everything down and folds service outcomes into the test's
//!   JUnit XML.
//!
//! Everything is scoped to a single test invocation and its scratch
//! directory; nothing survives the daemon's exit.

pub mod client;
pub mod controller;
pub mod defs;
pub mod error;
pub mod healthcheck;
pub mod junit;
pub mod paths;
pub mod procinfo;
pub mod server;
pub mod service;
pub mod state;
pub mod supervisor;
pub mod topological;
pub mod wire;

pub use client::{ControlChannel, ServiceHandle};
pub use controller::Controller;
pub use error::{Error, Result};
pub use paths::ControlPaths;
pub use service::{fmt_duration, Service};
pub use state::ServiceState;
