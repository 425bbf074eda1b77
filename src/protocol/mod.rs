//! Wire protocol: binary packet codec, block padding, announce TLVs and the
//! fragment sub-format used to squeeze large packets through BLE writes.

pub mod announce;
pub mod fragment;
pub mod packet;
pub mod padding;
pub mod peer_id;

pub use announce::AnnouncePayload;
pub use fragment::FragmentPayload;
pub use packet::{Packet, PacketType, ProtocolError};
