//! Route modules for the OSS server

pub mod files;
pub mod health;
pub mod upload;
