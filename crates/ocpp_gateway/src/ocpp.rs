mod frame;
mod version;

pub use frame::*;
pub use version::*;
