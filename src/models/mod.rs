pub mod job;
pub mod reprocess;
