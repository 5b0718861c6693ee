pub mod app;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod extractor;
pub mod ledger;
pub mod messages;
pub mod routes;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
