pub mod handler;
pub mod listener;
pub mod model;

pub use handler::*;
