pub mod broadcast;
pub mod handler;
pub mod messages;
pub mod signal;

pub use handler::ws_upgrade;
