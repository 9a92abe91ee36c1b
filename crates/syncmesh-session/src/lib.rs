//! SyncMesh Session - Coordination sessions over a stream transport
//!
//! A [`CoordinationSession`] makes one node a member of a named session:
//! - discovers the session network and joins it, or creates it when none
//!   exists, taking the role the topology assigns
//! - keeps membership current from heartbeats, periodic discovery and
//!   departure announcements, evicting silent nodes
//! - elects a coordinator when the topology calls for one
//! - creates data streams and wires consumers to every producer of the same
//!   stream in the session
//!
//! Everything a session owns lives in a single task; handles talk to it
//! through requests and read state from watch channels.

mod actor;
pub mod election;
pub mod event;
pub mod messages;
pub mod network;
pub mod observability;
pub mod protocol;
pub mod session;

pub use election::*;
pub use event::*;
pub use messages::*;
pub use network::*;
pub use observability::*;
pub use protocol::*;
pub use session::*;
