pub mod collector;
pub mod protocol;
pub mod session;

pub use session::*;
