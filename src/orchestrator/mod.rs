//! Application-level orchestration utilities.
//!
//! This module owns the launch lifecycle (start, signal forwarding, completion) and post-launch
//! processing such as report export. The CLI layer calls into this module to keep
//! responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::run_controller;
pub(crate) use post_process::process_run_completion;
