#![warn(
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented
)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::struct_excessive_bools,
    clippy::struct_field_names
)]

pub mod certs;
pub mod configuration;
pub mod env;
pub mod haproxy;
pub mod instance;
mod instrumentation;
pub mod maps;
pub mod models;
pub mod process;
pub mod render;
pub mod rules;
pub mod runtime;

pub use haproxy::{HAProxy, HAProxyError};
