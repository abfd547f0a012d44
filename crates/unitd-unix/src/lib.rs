//! Unix process plumbing for unitd: spawning with a resolved identity,
//! signal subscriptions and the fork/pipe daemon handshake.

pub mod daemon;
pub mod identity;
pub mod signals;
mod unix_process;

pub use daemon::{Fork, HandshakeReader, HandshakeWriter, daemonize, read_handshake};
pub use identity::{ResolvedIdentity, resolve_group, resolve_identity, resolve_user};
pub use signals::{SignalHub, SignalSubscription};
pub use unix_process::{SpawnRequest, UnixProcessHandle, describe_exit, send_signal, spawn};

pub fn platform_name() -> &'static str {
    "Unix"
}
