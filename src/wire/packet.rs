//! Wire packet framing.
//!
//! Every packet starts with a fixed 32 byte header:
//!
//! | offset | size | field        |
//! |--------|------|--------------|
//! | 0      | 8    | signature    |
//! | 8      | 4    | header crc   |
//! | 12     | 4    | payload crc  |
//! | 16     | 4    | command      |
//! | 20     | 2    | seq          |
//! | 22     | 2    | seq reply    |
//! | 24     | 4    | flags        |
//! | 28     | 4    | payload size |
//!
//! Header fields are always little-endian. Bytes between packets are "noise"
//! (usually raw device console output) and are reported as such.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{debug, warn};
use std::fmt::{Debug, Display, Formatter};

pub const SIGNATURE: &[u8; 8] = b"MSdbgV1\0";
pub const HEADER_SIZE: usize = 32;
/// Largest payload accepted from the device.
pub const MAX_PAYLOAD: usize = 64 * 1024;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u32 {
        /// Sender does not expect an acknowledge.
        const NON_CRITICAL = 0x0001;
        /// Packet is a reply to a command.
        const REPLY = 0x0002;
        const BAD_HEADER = 0x0004;
        const BAD_PAYLOAD = 0x0008;
        /// Receiver must not serve this command from a cache.
        const NO_CACHING = 0x0010;
        const NACK = 0x4000;
        const ACK = 0x8000;
    }
}

/// Command identifier. Commands are opaque for the transport layer,
/// well-known ids are listed as associated constants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Command(pub u32);

macro_rules! commands {
    ($($name: ident = $id: expr),+ $(,)?) => {
        impl Command {
            $(pub const $name: Command = Command($id);)+

            /// Return well-known command name.
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($id => Some(stringify!($name)),)+
                    _ => None,
                }
            }
        }
    };
}

commands! {
    PING = 0x0000_0000,
    MESSAGE = 0x0000_0001,
    READ_MEMORY = 0x0000_0002,
    WRITE_MEMORY = 0x0000_0003,
    CHECK_MEMORY = 0x0000_0004,
    ERASE_MEMORY = 0x0000_0005,
    EXECUTE = 0x0000_0006,
    REBOOT = 0x0000_0007,
    MEMORY_MAP = 0x0000_0008,
    PROGRAM_EXIT = 0x0000_0009,
    FLASH_SECTOR_MAP = 0x0000_000C,

    EXECUTION_CHANGE_CONDITIONS = 0x0002_0001,
    EXECUTION_BREAKPOINTS = 0x0002_0005,
    EXECUTION_BREAKPOINT_HIT = 0x0002_0006,
    EXECUTION_BREAKPOINT_STATUS = 0x0002_0007,
    EXECUTION_QUERY_CAPABILITIES = 0x0002_0008,
    EXECUTION_SET_CURRENT_APP_DOMAIN = 0x0002_0009,

    THREAD_LIST = 0x0002_0011,
    THREAD_STACK = 0x0002_0012,
    THREAD_KILL = 0x0002_0013,
    THREAD_SUSPEND = 0x0002_0014,
    THREAD_RESUME = 0x0002_0015,
    THREAD_GET_EXCEPTION = 0x0002_0016,
    THREAD_CREATE_EX = 0x0002_0018,

    VALUE_RESIZE_SCRATCH_PAD = 0x0002_0030,
    VALUE_GET_STACK = 0x0002_0031,
    VALUE_GET_FIELD = 0x0002_0032,
    VALUE_GET_SCRATCH_PAD = 0x0002_0035,
    VALUE_SET_BLOCK = 0x0002_0036,
    VALUE_ALLOCATE_OBJECT = 0x0002_0038,
    VALUE_ALLOCATE_STRING = 0x0002_0039,

    TYPE_SYS_ASSEMBLIES = 0x0002_0040,
    TYPE_SYS_APP_DOMAINS = 0x0002_0044,

    RESOLVE_ASSEMBLY = 0x0002_0050,
    RESOLVE_APP_DOMAIN = 0x0002_0055,

    MESSAGING_QUERY = 0x0002_0090,
    MESSAGING_SEND = 0x0002_0091,
    MESSAGING_REPLY = 0x0002_0092,
}

impl Command {
    /// True for the three rpc messaging commands.
    pub fn is_messaging(self) -> bool {
        matches!(
            self,
            Command::MESSAGING_QUERY | Command::MESSAGING_SEND | Command::MESSAGING_REPLY
        )
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#010X}", self.0),
        }
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub cmd: Command,
    pub seq: u16,
    pub seq_reply: u16,
    pub flags: PacketFlags,
}

#[derive(Clone, Debug)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(cmd: Command, seq: u16, flags: PacketFlags, payload: Bytes) -> Self {
        Self {
            header: Header {
                cmd,
                seq,
                seq_reply: 0,
                flags,
            },
            payload,
        }
    }

    /// Create a reply for `request` packet.
    pub fn reply_to(
        request: &Header,
        seq: u16,
        flags: PacketFlags,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            header: Header {
                cmd: request.cmd,
                seq,
                seq_reply: request.seq,
                flags: flags | PacketFlags::REPLY,
            },
            payload: payload.into(),
        }
    }

    #[inline(always)]
    pub fn cmd(&self) -> Command {
        self.header.cmd
    }

    #[inline(always)]
    pub fn is_reply(&self) -> bool {
        self.header.flags.contains(PacketFlags::REPLY)
    }

    /// True if device explicitly rejects a command.
    #[inline(always)]
    pub fn is_nack(&self) -> bool {
        self.header.flags.contains(PacketFlags::NACK)
    }

    /// Serialize packet into wire representation.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(SIGNATURE);
        buf.put_u32_le(0);
        buf.put_u32_le(crc32(&self.payload));
        buf.put_u32_le(self.header.cmd.0);
        buf.put_u16_le(self.header.seq);
        buf.put_u16_le(self.header.seq_reply);
        buf.put_u32_le(self.header.flags.bits());
        buf.put_u32_le(self.payload.len() as u32);
        let header_crc = crc32(&buf[..HEADER_SIZE]);
        buf[8..12].copy_from_slice(&header_crc.to_le_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Continue CRC-32 calculation over `data`.
pub fn crc32_update(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// CRC-32 (IEEE) of `data`. Used for packet integrity and flash sector checksums.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Unit produced by [`PacketAssembler`].
#[derive(Debug)]
pub enum Frame {
    Packet(Packet),
    /// Bytes received outside of any packet.
    Noise(Bytes),
}

/// Incremental packet parser. Feed it with raw transport bytes and pull frames out.
#[derive(Default)]
pub struct PacketAssembler {
    buf: BytesMut,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Return next complete frame if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(start) = find_signature(&self.buf) else {
                // keep a tail that may be a beginning of signature
                let keep = partial_signature_len(&self.buf);
                let noise_len = self.buf.len() - keep;
                if noise_len == 0 {
                    return None;
                }
                return Some(Frame::Noise(self.buf.split_to(noise_len).freeze()));
            };

            if start > 0 {
                return Some(Frame::Noise(self.buf.split_to(start).freeze()));
            }

            if self.buf.len() < HEADER_SIZE {
                return None;
            }

            let header_bytes = &self.buf[..HEADER_SIZE];
            let mut zeroed = [0u8; HEADER_SIZE];
            zeroed.copy_from_slice(header_bytes);
            zeroed[8..12].fill(0);

            let mut cursor = &header_bytes[8..];
            let crc_header = cursor.get_u32_le();
            let crc_data = cursor.get_u32_le();
            let cmd = Command(cursor.get_u32_le());
            let seq = cursor.get_u16_le();
            let seq_reply = cursor.get_u16_le();
            let flags = PacketFlags::from_bits_retain(cursor.get_u32_le());
            let size = cursor.get_u32_le() as usize;

            if crc32(&zeroed) != crc_header || size > MAX_PAYLOAD {
                debug!(target: "wire", "bad packet header, skip signature");
                // a false signature, first byte becomes a noise
                return Some(Frame::Noise(self.buf.split_to(1).freeze()));
            }

            if self.buf.len() < HEADER_SIZE + size {
                return None;
            }

            self.buf.advance(HEADER_SIZE);
            let payload = self.buf.split_to(size).freeze();
            if crc32(&payload) != crc_data {
                warn!(target: "wire", "drop packet {cmd} (seq {seq}) with bad payload crc");
                continue;
            }

            return Some(Frame::Packet(Packet {
                header: Header {
                    cmd,
                    seq,
                    seq_reply,
                    flags,
                },
                payload,
            }));
        }
    }
}

fn find_signature(buf: &[u8]) -> Option<usize> {
    buf.windows(SIGNATURE.len()).position(|w| w == SIGNATURE)
}

fn partial_signature_len(buf: &[u8]) -> usize {
    (1..SIGNATURE.len())
        .rev()
        .find(|&n| buf.len() >= n && buf[buf.len() - n..] == SIGNATURE[..n])
        .unwrap_or(0)
}
