pub mod config;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod request;

pub use config::*;
pub use errors::*;
pub use gateway::*;
pub use models::*;
pub use request::*;
