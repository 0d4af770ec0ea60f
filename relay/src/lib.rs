pub mod config;
pub mod db;
pub mod errors;
pub mod identity;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod pairing;
pub mod publisher;
pub mod registry;
pub mod rest;
pub mod store;
pub mod topics;
pub mod validate;
