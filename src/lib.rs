pub mod config;
pub mod error;
pub mod geometry;
pub mod health;
pub mod io;
pub mod sim;
pub mod tracking;
