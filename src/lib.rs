#![forbid(unsafe_code)]

// sweepserv library - bridge room cleanup service for Matrix homeservers

pub mod api;
pub mod cleaner;
pub mod config;
pub mod ids;
pub mod loops;
pub mod metrics;
pub mod queue;
pub mod roomlist;
pub mod router;
pub mod rules;
pub mod sessions;
pub mod synapse;
