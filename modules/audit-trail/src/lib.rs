pub mod catalog;
pub mod config;
pub mod db;
pub mod handlers;
pub mod metrics;
pub mod migrations;
pub mod models;
pub mod repos;
pub mod routes;
pub mod secrets;
pub mod services;
pub mod transport;

pub use handlers::build_dispatch_table;
