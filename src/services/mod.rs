//! Coordination services used by the websocket routes and the scheduler.
//!
//! ARCHITECTURE
//! ============
//! Service modules own the coordination logic and persistence concerns so
//! route handlers can stay focused on protocol translation. `liveness`
//! and `election` are pure; `room` owns the transactional boundary;
//! `lobby` and `reaper` are eventually consistent by design.

pub mod election;
pub mod liveness;
pub mod lobby;
pub mod notify;
pub mod reaper;
pub mod room;
