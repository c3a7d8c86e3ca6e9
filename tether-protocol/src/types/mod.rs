pub mod results;
pub mod tools;

pub use results::*;
pub use tools::*;
