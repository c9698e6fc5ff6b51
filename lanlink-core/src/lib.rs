//! lanlink protocol core.
//! Host-driven: no sockets or timers; host passes datagrams and ticks and receives actions.

pub mod chunk;
pub mod core;
pub mod integrity;
pub mod membership;
pub mod protocol;
pub mod reliable;
pub mod store;
pub mod transfer;
pub mod wire;

pub use self::core::{Action, CoreConfig, NodeCore, NodeEvent, Outbound, SendError};
pub use membership::{PeerRecord, CLEANUP_INTERVAL, DEVICE_TIMEOUT, HEARTBEAT_INTERVAL};
pub use protocol::{Frame, NackReason, DEFAULT_PORT, MAX_FRAME_LEN};
pub use reliable::{RetransmitPolicy, RESEND_INTERVAL};
pub use store::{DiskStore, MemoryStore, TransferStore};
pub use transfer::{TransferEvent, TransferPhase};
pub use wire::{decode_frame, encode_frame, FrameDecodeError};
