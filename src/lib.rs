pub mod alerts;
pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod poller;
pub mod realtime;
pub mod repo;
pub mod scoring;
pub mod upstream;
