//! UpTrail: uptime monitoring for web services.
//!
//! Targets are checked on their own schedule, results are folded into
//! per-target statistics, and status transitions become incidents.

pub mod config;
pub mod db;
pub mod engine;
pub mod incident;
pub mod notify;
pub mod probe;
pub mod recorder;
pub mod scheduler;
pub mod web;
