pub mod adaptive;
pub mod calibration;
pub mod config;
pub mod contract_store;
pub mod decision;
pub mod edge;
pub mod error;
pub mod fusion;
pub mod gateway;
pub mod model;
pub mod observation;
pub mod persistence;
pub mod pipeline;
pub mod risk;
pub mod server;
pub mod settlement;
pub mod signal;
pub mod sizing;
pub mod state;
