pub mod config;
pub mod experiments;

pub use config::*;
pub use experiments::*;
