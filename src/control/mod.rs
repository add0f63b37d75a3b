//! The control-socket server: wire protocol plus accept/dispatch.

pub mod protocol;
pub mod server;

pub use server::ControlSocket;
