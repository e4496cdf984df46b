pub mod config;
pub mod entities;
pub mod error;
pub mod fsm;
pub mod ids;
pub mod plugin_data;

pub use error::{Error, Result};
pub use fsm::TaskState;
