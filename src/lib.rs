pub mod config;
pub mod feed;
pub mod firehose;
pub mod hydrator;
pub mod scheduler;
pub mod store;
