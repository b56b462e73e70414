pub mod approvals;
pub mod events;
pub mod queue;
pub mod runs;
