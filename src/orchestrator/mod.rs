//! Session orchestration modules.
//!
//! Covers fork process lifecycle, the persisted task dependency graph,
//! snapshot/checkpoint state capture, and session recovery.

pub mod checkpoint_manager;
pub mod fork_manager;
pub mod session_manager;
pub mod snapshot_manager;
pub mod task_graph;
