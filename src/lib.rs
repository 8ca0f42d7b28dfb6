//! Real-time capture of sensor observations into a sharded, numbered
//! training dataset.

pub mod bus;
pub mod collector;
pub mod config;
pub mod dataset;
pub mod export;
pub mod persist;
pub mod sensor;
