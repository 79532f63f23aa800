use crate::error::Error;
use crate::rpc::EndPoint;
use crate::wire::{PayloadReader, PayloadWriter};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Unit of rpc correlation: a reply carries the address of the call it answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageAddress {
    pub seq: u32,
    pub from: EndPoint,
    pub to: EndPoint,
}

impl MessageAddress {
    pub(crate) fn write(&self, writer: PayloadWriter) -> PayloadWriter {
        writer
            .u32(self.seq)
            .u32(self.from.kind)
            .u32(self.from.id)
            .u32(self.to.kind)
            .u32(self.to.id)
    }

    pub(crate) fn read(reader: &mut PayloadReader) -> Result<Self, Error> {
        Ok(MessageAddress {
            seq: reader.u32()?,
            from: EndPoint::new(reader.u32()?, reader.u32()?),
            to: EndPoint::new(reader.u32()?, reader.u32()?),
        })
    }

    /// Registration announcement, the endpoint addresses itself.
    pub fn is_announcement(&self) -> bool {
        self.from == self.to
    }
}

impl Display for MessageAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {} -> {}", self.seq, self.from, self.to)
    }
}

/// Body of a `MESSAGING_SEND` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct CallMessage {
    pub(crate) method: String,
    pub(crate) args: serde_json::Value,
}

/// Body of a `MESSAGING_REPLY` frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum ReplyMessage {
    Ok(serde_json::Value),
    Fault { type_name: String, message: String },
}
