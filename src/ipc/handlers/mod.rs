pub mod blockers;
pub mod carryover;
pub mod core;
pub mod grading;
pub mod lifecycle;
pub mod logs;
pub mod plans;
pub mod settings;
pub mod unlock;
