//! Backlog and Kanban board service: projects, epics, stories, issues and
//! sprints behind a role-gated REST API, with WSJF-style backlog ranking
//! and progress reporting.

pub mod api;
pub mod board;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod policy;
pub mod priority;
pub mod reports;
pub mod server;
