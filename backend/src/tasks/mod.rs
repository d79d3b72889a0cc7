pub mod job;
pub mod model;
pub mod queue;
pub mod store;
pub mod task_service;
