pub mod config;
pub mod interaction;
pub mod log_error;
pub mod message;
pub mod thought;
