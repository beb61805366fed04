//! Portless - stable `name.localhost` URLs for local dev servers
//!
//! This library backs the `portless` CLI:
//! - Routes HTTP/1.1, HTTP/2, and WebSocket traffic by Host header to
//!   short-lived dev servers on ephemeral ports
//! - Shares a single on-disk route table between the proxy daemon and all
//!   registrant processes, with liveness-based garbage collection
//! - Serves HTTPS and plain HTTP on the same port by peeking at the first
//!   byte of each connection
//! - Mints per-hostname certificates from an on-demand local CA
//! - Spawns dev commands with `PORT` set and tears their routes down on
//!   exit

pub mod certs;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hostname;
pub mod listener;
pub mod proxy;
pub mod routes;
pub mod runner;
pub mod state;
