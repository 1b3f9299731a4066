mod dispatcher;
mod foreground;
mod service;

pub use foreground::{ForegroundHandle, ForegroundLoop, ForegroundTask};
pub use service::SerialService;
