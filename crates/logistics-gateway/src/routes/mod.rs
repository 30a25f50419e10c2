pub mod gateway;
pub mod health;

pub use gateway::dispatch;
