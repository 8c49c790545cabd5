//! OCR microservice built around a pool of supervised engine processes.
//!
//! Clients POST a PDF and get back the recognized text plus a page count.
//! The recognition itself happens in external child processes (one loaded
//! OCR engine each) that the [`pool`] module spawns, feeds over a
//! line-delimited JSON protocol, and respawns when they die.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod pool;
pub mod prelude;
pub mod server;
