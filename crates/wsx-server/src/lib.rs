//! # wsx-server
//!
//! Axum adapter for [`wsx_core`]. Upgrades HTTP requests on a configurable
//! path to WebSocket sessions that feed a shared [`Hub`](wsx_core::Hub).
//!
//! - [`Server`] / [`ServerOptions`] build the router; [`Server::listen`]
//!   binds and returns a [`ServerHandle`]
//! - One session task per socket with a bounded send queue and ping/pong
//!   heartbeat
//! - `/health` and `/metrics` alongside the upgrade route
//! - Layered config: defaults, JSON file, `WSX_*` environment

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod loader;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use loader::{ConfigError, load_config};
pub use server::{Server, ServerHandle, ServerOptions};
pub use shutdown::ShutdownCoordinator;
