//! Practice scheduler — daily task generation, habit streaks and guarded
//! background jobs behind a small HTTP trigger surface.

pub mod api;
pub mod civil;
pub mod config;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod schedule;
pub mod store;
pub mod streaks;
