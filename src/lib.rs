pub mod cache;
pub mod controller;
pub mod controller_manager;
pub mod error;
pub mod events;
pub mod leader;
pub mod opts;
pub mod queue;
pub mod resources;
pub mod serve;
pub mod store;
pub mod utils;

pub use error::Error;
