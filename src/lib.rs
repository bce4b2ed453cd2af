pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod inventory;
pub mod output;
pub mod progress;
pub mod reconcile;
pub mod remote;
pub mod store;
pub mod timegrid;
