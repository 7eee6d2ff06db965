//! HTTP surface: caller identification, quota admission, job submission
//! and status.

pub mod app;
pub mod context;
pub mod middleware;
