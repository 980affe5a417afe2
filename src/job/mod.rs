pub mod model;
pub mod sqlite;
pub mod store;

pub use model::{ForwardSpec, InputForwardMode, Job, JobStatus, JobType};
pub use sqlite::SqliteJobStore;
pub use store::{JobStore, MemoryJobStore};
