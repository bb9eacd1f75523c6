pub mod alerts;
pub mod config;
pub mod errors;
pub mod feed;
pub mod geo;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod poller;
pub mod rest;
pub mod state;
pub mod store;
pub mod validate;
