//! # wsx-client
//!
//! tokio-tungstenite adapter for [`wsx_core`]: connects to a wsx server and
//! exposes the same typed send and listener surface as the server side,
//! minus the connection argument.

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;

pub use client::{Client, ClientOptions};
pub use config::ClientConfig;
pub use errors::{ClientError, Result};
