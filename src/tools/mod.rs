//! Built-in tools available to the model during a session.

pub mod executor;
pub mod terminal;

pub use executor::ToolExecutor;
pub use terminal::{TerminalTool, ToolFailure};
