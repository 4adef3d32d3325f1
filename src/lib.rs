pub mod config;
pub mod dates;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod inference;
pub mod job;
pub mod model;
pub mod pool;
pub mod scheduler;
pub mod strategy;
