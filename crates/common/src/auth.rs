mod password;
mod traits;

pub use password::*;
pub use traits::*;
