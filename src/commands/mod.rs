pub mod callback;
pub mod driver;
pub mod handle;
pub mod report;

pub use callback::{CallbackHooks, CallbackObserver, CmdCallback, NoHooks, OnFinished};
pub use driver::{LoopPolicy, LoopState, PollDriver};
pub use handle::{CallbackSink, Handle, HandleId, HandleState, Outcome, Registration};
pub use report::DeleteReporter;
