pub mod circuit_breaker;
pub mod commands;
pub mod config;
pub mod connection;
pub mod health;
pub mod integrity;
pub mod modbus;
pub mod output;
pub mod plc;
pub mod procedure;
pub mod simulator;
pub mod table;
pub mod tag_service;
pub mod tags;
