//! # blelink-server
//!
//! HTTP server library for blelink.
//!
//! This library provides the API handlers, the shared state wrapping one
//! [`blelink_core::Registry`], and the simulated demo radio.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod demo;
pub mod logging;
pub mod state;
