mod command_input;
mod input;

pub use command_input::{CommandInput, CommandResult};
