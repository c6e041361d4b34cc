pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod host;
pub mod main_loop;
pub mod policy;
pub mod protocol;
pub mod python;
pub mod sandbox;
pub mod session;
pub mod validator;

pub use bridge::{Bridge, BridgeState, Job, JobOutcome};
pub use config::BridgeConfig;
pub use error::Fault;
pub use host::{HostApi, Scene};
pub use main_loop::MainLoop;
pub use policy::WhitelistPolicy;
pub use protocol::{Request, RequestFrame, RequestId, Response};
pub use python::PythonInterpreter;
pub use sandbox::{Interpreter, Sandbox};
pub use session::{Dispatcher, SessionRegistry, Transport};
pub use validator::Validator;
