//! Balancer Studio - configuration lifecycle manager for nginx
//!
//! Keeps a running nginx instance in step with a store of proxy hosts,
//! certificates and upstream pools:
//! - Renders the entity set into a complete, deterministic nginx.conf
//! - Checks every candidate with nginx's own syntax check before use
//! - Activates and reloads through a single coordinator that rolls back on failure
//! - Coalesces bursts of edits into one apply
//! - Expires certificates on a schedule and re-renders without them

pub mod api;
pub mod apply;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod process;
pub mod queue;
pub mod render;
pub mod store;
pub mod sweep;
pub mod validate;
