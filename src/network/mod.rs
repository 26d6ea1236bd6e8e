pub mod codec;
pub mod frame;
pub mod stream;

pub use codec::{CodecError, PacketReader, PacketWriter};
pub use frame::{read_frame, ErrorBody, Frame, FrameKind, FrameLimits, MAX_TAG_LEN};
pub use stream::{SyncStream, TcpSyncStream};
