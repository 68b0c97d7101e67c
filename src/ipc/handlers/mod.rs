pub mod backup;
pub mod batches;
pub mod core;
pub mod results;
pub mod setup;
