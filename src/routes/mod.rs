pub mod card;
pub mod connection;
pub mod user;
