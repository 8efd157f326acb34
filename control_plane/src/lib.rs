#![warn(
    clippy::pedantic,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used,
    clippy::expect_used
)]
#![allow(
    clippy::needless_pass_by_value,
    clippy::needless_continue,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::struct_excessive_bools,
    clippy::struct_field_names
)]

pub mod annotations;
pub mod cli;
pub mod controller;
pub mod default_service;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod ingress;
mod instrumentation;
pub mod kubernetes;
pub mod options;
pub mod route;
pub mod service;
pub mod status;
pub mod store;
#[cfg(test)]
mod testing;
