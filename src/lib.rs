pub mod config;
pub mod controller;
pub mod export;
pub mod monitor;
pub mod pipeline;
pub mod reconcile;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod throttle;
