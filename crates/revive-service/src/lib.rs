#[macro_use]
pub mod metrics;

pub mod cell;
pub mod config;
pub mod logging;
pub mod services;
pub mod sync;
pub mod utils;
