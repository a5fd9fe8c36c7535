pub mod config;
pub mod container;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod platform;
pub mod report;
pub mod runner;
pub mod stats;
