//! Cluster sync protocol reference implementation.
//! No I/O: the daemon feeds bytes in and writes the returned bytes out.

pub mod archive;
pub mod cipher;
pub mod integrity;
pub mod protocol;
pub mod scheduler;
pub mod status;
pub mod sync;
pub mod wire;

pub use cipher::{CipherError, ClusterKey};
pub use protocol::{Command, Envelope, ProtocolError, Request, Response, PLAIN_SIZE};
pub use scheduler::{Role, RoundDecision, SyncInterval};
pub use status::{PeerStatus, RoundSnapshot, SharedStatus, SyncRoundCounters};
pub use sync::{ApplyOutcome, FileEntry, FileSet, SyncError};
pub use wire::{decode_frame, encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError, TERMINATOR};
