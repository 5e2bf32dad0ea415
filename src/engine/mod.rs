pub mod aggregator;
pub mod book;
pub mod reconcile;
pub mod types;
