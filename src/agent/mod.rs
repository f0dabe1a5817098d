//! Host-side agent: job control around the coordination runner.
//!
//! The agent leases jobs from the remote build service, turns each job into
//! a multi-container workload, runs one coordination runner per workload,
//! and reports the aggregated result. The build service and the container
//! orchestrator are collaborators behind the [`api::BuildApi`] and
//! [`workload::Orchestrator`] traits; this crate implements neither.
//!
//! ```text
//! build service ──lease──▶ controller ──create──▶ orchestrator
//!                             │                        │
//!                             ▼                        ▼
//!                      runner (unix socket) ◀── containers running
//!                             │                  `capstan exec`
//!                             └──logs / wait status──▶ build service
//! ```

pub mod api;
pub mod controller;
pub mod exec;
pub mod workload;

pub use controller::{JobController, JobOutcome, SHUTDOWN_EXIT_CODE};
