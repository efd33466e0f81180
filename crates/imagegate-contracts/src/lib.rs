pub mod classify;
pub mod config;
pub mod errors;
pub mod events;
pub mod providers;
pub mod receipts;
pub mod state;
