pub mod cancellation;
pub mod dispatcher;
pub mod job_store;
pub mod tenants;
pub mod worker;
