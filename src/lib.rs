pub mod commands;
pub mod config;
pub mod error;
pub mod service;
pub mod transport;
pub mod utils;

pub use commands::{CallbackHooks, CmdCallback, Handle, LoopPolicy, Outcome};
pub use error::{CmdError, CmdResult, ServerError};
pub use service::{LocalService, Session};
pub use transport::{Request, Response, Status};
