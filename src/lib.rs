pub mod app;
pub mod client;
pub mod config;
pub mod domain;
pub mod error;
pub mod links;
pub mod output;
pub mod progress;
pub mod session;
pub mod state;
pub mod upload;
