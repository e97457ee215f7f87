pub mod driver;
pub mod job;
pub mod jobdb;
pub mod manager;

pub use driver::{Driver, StopReason};
pub use job::{Job, JobState};
pub use jobdb::{JobDb, Storage};
pub use manager::{CycleReport, JobManager};
