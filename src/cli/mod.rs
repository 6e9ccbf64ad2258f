pub mod console;

pub use console::{format_history, stream_turn};
