//! Capstan - coordination agent for multi-container build jobs.
//!
//! A build job runs as a workload of several containers: a checkout
//! container that prepares the shared working directory, a command container
//! that runs the user's build command, and any number of auxiliary sidecars.
//! Every container embeds the `capstan` binary; the host-side agent embeds
//! it too.
//!
//! The [`runner`] module is the in-workload coordination core: a small RPC
//! server on a unix socket that sequences the containers through a fixed
//! three-phase discipline and aggregates their exit statuses into the job's
//! final wait status. The [`agent`] module is the host side: it turns a
//! leased job into a workload spec, runs the coordination server, streams
//! captured logs to the build service, and reports the final status.

pub mod agent;
pub mod config;
pub mod runner;
