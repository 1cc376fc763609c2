pub mod config;
pub mod credentials;
pub mod dag;
pub mod errors;
pub mod naming;
pub mod pipeline;
pub mod policy;
pub mod provision;
pub mod resource;
pub mod stack;
pub mod telemetry;
pub mod ui;
