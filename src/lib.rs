pub mod app;
pub mod catalog;
pub mod cds;
pub mod config;
pub mod domain;
pub mod error;
pub mod exporter;
pub mod fetch;
pub mod layout;
pub mod output;
pub mod provenance;
pub mod scanner;
