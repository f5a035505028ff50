pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod network;
pub mod observer;
pub mod operator;
pub mod qmp;
pub mod routes;
pub mod vm_lock;
