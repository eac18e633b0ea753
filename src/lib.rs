pub mod auth;
pub mod conf;
pub mod data;
pub mod docs;
pub mod gateway;
pub mod keys;
pub mod ledger;
pub mod payments;
pub mod provider;
pub mod registry;
pub mod server;
pub mod tracing;
pub mod types;
