pub mod api;
pub mod auth;
pub mod config;
pub mod files;
pub mod ws;
