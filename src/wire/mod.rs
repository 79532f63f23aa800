pub mod packet;
pub mod payload;

pub use packet::{Command, Frame, Header, Packet, PacketAssembler, PacketFlags};
pub use payload::{Endian, PayloadReader, PayloadWriter};
