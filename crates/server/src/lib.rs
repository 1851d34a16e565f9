//! HTTP service and command line front end for VAR text-to-image generation.

pub mod api;
pub mod config;
pub mod logging;
pub mod shutdown;
