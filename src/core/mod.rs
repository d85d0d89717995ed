//! VM lifecycle supervision: protocol handling, bookkeeping and the
//! host side effects it triggers.

pub mod cleanup;
pub mod client;
pub mod decoder;
pub mod escalator;
pub mod host;
pub mod identity;
pub mod message;
pub mod process;
pub mod registry;
pub mod server;
pub mod supervisor;

pub use cleanup::{CleanupRequest, ignore_child_exits};
pub use client::{Connection, ConnectionId, ProtocolState, Role, VmSession};
pub use decoder::{Decoder, Frame};
pub use escalator::{Escalator, ForcedKill, KillOutcome};
pub use host::{Host, SystemHost};
pub use identity::{IdentityError, VmId};
pub use message::Message;
pub use process::ProcessRef;
pub use registry::VmRegistry;
pub use server::{ControlSocket, ShutdownSignals};
pub use supervisor::Supervisor;
