mod charge_point_repository;
mod client;
mod config;

pub use charge_point_repository::*;
pub use client::*;
pub use config::*;
