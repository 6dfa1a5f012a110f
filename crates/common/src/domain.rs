mod charge_point;
mod in_memory_charge_point_repository;
mod result;

pub use charge_point::*;
pub use in_memory_charge_point_repository::*;
pub use result::*;
