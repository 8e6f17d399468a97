pub mod commands;
pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use commands::{CommandSpec, CommandTable, Priority, ValueKind};
pub use constants::MessageType;
pub use messages::{Inbound, ParseError, parse_inbound};
pub use types::Stats;
