//! SSH server module.

mod console;
mod direct;
mod forward;
mod handler;
mod handler_impl;
mod server;
mod types;

pub use console::{Console, ConsoleReply, EditorEvent, LineEditor, MenuState};
pub use direct::{allow_all, DirectAuthorizer, DirectForwarder};
pub use forward::{ChannelOpener, ForwardedStream, RemoteForwards, CANONICAL_BIND_ADDRESS};
pub use handler::SshHandler;
pub use server::TunnelServer;
pub use types::{generate_session_id, SessionTerminal};
