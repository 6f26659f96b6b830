//! Devbox: chat-driven provisioning and supervision of per-user dev
//! containers.
//!
//! The core is the lifecycle orchestrator in [`vm`]; [`engine`] adapts the
//! container engine CLI, [`tunnel`] supervises web terminal sessions, and
//! [`dispatch`] turns chat lines into orchestrator calls.

pub mod db;
pub mod dispatch;
pub mod engine;
pub mod plan;
pub mod settings;
pub mod tunnel;
pub mod user;
pub mod vm;
