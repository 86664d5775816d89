//! Hotify - a self-hosted deploy daemon
//!
//! This library provides a small continuous-deployment supervisor that:
//! - Clones each configured service's git repository and runs its build
//! - Launches the service and restarts it when it crashes, up to a limit
//! - Publishes reverse-proxy routes (Caddy) while a service is running
//! - Redeploys on signed webhooks (pull, build, restart)
//! - Exposes an HMAC-signed management API to create, delete and control services

pub mod config;
pub mod error;
pub mod git;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod service;
pub mod signature;
pub mod store;
pub mod supervisor;
