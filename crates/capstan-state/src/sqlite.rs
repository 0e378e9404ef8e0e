mod core;
mod executors;
mod jobs;
mod runs;
mod task_queue;
mod workflows;

pub use self::core::SqliteStore;
