pub mod lifecycle;
pub mod server;
pub mod status;

pub use lifecycle::{Daemon, HintRouter};
pub use server::{ControlClient, Request, Response, RpcError, Server, ShutdownHandle};
pub use status::build_sync_status;
