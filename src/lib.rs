pub mod backup;
pub mod config;
pub mod error;
pub mod health_check;
pub mod install;
pub mod observability;
pub mod rotation;
pub mod service;
pub mod system;
pub mod tls;
