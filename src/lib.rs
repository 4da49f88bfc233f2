pub mod catalog;
pub mod config;
pub mod data_types;
pub mod fields;
pub mod filters;
pub mod lifecycle;
pub mod naming;
pub mod query;
pub mod repository;
pub mod synthesizer;
