pub mod adapter;
pub mod connection;
pub mod service;
