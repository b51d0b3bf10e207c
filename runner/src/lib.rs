pub mod baseline;
pub mod batch;
pub mod config;
pub mod executors;
pub mod model;
pub mod orchestrator;
pub mod partition;
pub mod pool;
pub mod process;
pub mod results;
pub mod solver;
pub mod store;
pub mod task;
