mod credential;
mod resolver;

pub use credential::*;
pub use resolver::*;
