pub(crate) mod command;
pub(crate) mod console;
pub(crate) mod ui;

pub use self::command::{Args, Command, FakeArgs, LogLevel, OutputFormat};
pub use self::console::{Newline, TerminalArgs};
