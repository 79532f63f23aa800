use crate::error::Error;
use crate::process::assembly::{pack_index, TokenKind};
use crate::process::scratchpad::ScratchSlot;
use crate::process::Process;
use crate::wire::{Command, Endian, PayloadReader, PayloadWriter};
use crate::weak_error;
use bytes::Bytes;
use log::debug;
use std::fmt::{Display, Formatter};
use strum_macros::Display;

/// Runtime data type of a device value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum DataType {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    R4,
    I8,
    U8,
    R8,
    DateTime,
    TimeSpan,
    String,
    Object,
    Class,
    ValueType,
    SzArray,
    ByRef,
    Unknown(u32),
}

impl DataType {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x01 => DataType::Void,
            0x02 => DataType::Boolean,
            0x03 => DataType::Char,
            0x04 => DataType::I1,
            0x05 => DataType::U1,
            0x06 => DataType::I2,
            0x07 => DataType::U2,
            0x08 => DataType::I4,
            0x09 => DataType::U4,
            0x0A => DataType::R4,
            0x0B => DataType::I8,
            0x0C => DataType::U8,
            0x0D => DataType::R8,
            0x0E => DataType::DateTime,
            0x0F => DataType::TimeSpan,
            0x10 => DataType::String,
            0x11 => DataType::Object,
            0x12 => DataType::Class,
            0x13 => DataType::ValueType,
            0x14 => DataType::SzArray,
            0x15 => DataType::ByRef,
            other => DataType::Unknown(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            DataType::Void => 0x01,
            DataType::Boolean => 0x02,
            DataType::Char => 0x03,
            DataType::I1 => 0x04,
            DataType::U1 => 0x05,
            DataType::I2 => 0x06,
            DataType::U2 => 0x07,
            DataType::I4 => 0x08,
            DataType::U4 => 0x09,
            DataType::R4 => 0x0A,
            DataType::I8 => 0x0B,
            DataType::U8 => 0x0C,
            DataType::R8 => 0x0D,
            DataType::DateTime => 0x0E,
            DataType::TimeSpan => 0x0F,
            DataType::String => 0x10,
            DataType::Object => 0x11,
            DataType::Class => 0x12,
            DataType::ValueType => 0x13,
            DataType::SzArray => 0x14,
            DataType::ByRef => 0x15,
            DataType::Unknown(raw) => raw,
        }
    }
}

/// Decoded content of a value.
#[derive(Clone, Debug, PartialEq)]
pub enum ValueData {
    None,
    Bool(bool),
    Char(char),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    /// Reference types and structs, content is read field by field.
    Raw(Bytes),
}

/// Value of a stack slot, field or scratch pad slot.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeValue {
    /// Device heap reference, zero for null or unboxed primitives.
    pub reference: u32,
    pub data_type: DataType,
    pub flags: u32,
    /// Packed device index of value type.
    pub type_index: u32,
    pub data: ValueData,
}

impl RuntimeValue {
    pub(crate) fn read(reader: &mut PayloadReader, endian: Endian) -> Result<Self, Error> {
        let reference = reader.u32()?;
        let data_type = DataType::from_raw(reader.u32()?);
        let flags = reader.u32()?;
        let type_index = reader.u32()?;
        let raw = reader.blob()?;

        let mut data_reader = PayloadReader::new(raw.clone(), endian, "value data");
        let data = match data_type {
            DataType::Void => ValueData::None,
            DataType::Boolean => ValueData::Bool(data_reader.u8()? != 0),
            DataType::Char => {
                ValueData::Char(char::from_u32(data_reader.u16()? as u32).unwrap_or_default())
            }
            DataType::I1 => ValueData::Int(data_reader.u8()? as i8 as i64),
            DataType::U1 => ValueData::UInt(data_reader.u8()? as u64),
            DataType::I2 => ValueData::Int(data_reader.u16()? as i16 as i64),
            DataType::U2 => ValueData::UInt(data_reader.u16()? as u64),
            DataType::I4 => ValueData::Int(data_reader.i32()? as i64),
            DataType::U4 => ValueData::UInt(data_reader.u32()? as u64),
            DataType::R4 => ValueData::Float(f32::from_bits(data_reader.u32()?) as f64),
            DataType::I8 | DataType::DateTime | DataType::TimeSpan => {
                ValueData::Int(read_u64(&mut data_reader, endian)? as i64)
            }
            DataType::U8 => ValueData::UInt(read_u64(&mut data_reader, endian)?),
            DataType::R8 => ValueData::Float(f64::from_bits(read_u64(&mut data_reader, endian)?)),
            DataType::String if reference != 0 => {
                ValueData::Str(String::from_utf8(raw.to_vec())?)
            }
            _ => ValueData::Raw(raw),
        };

        Ok(RuntimeValue {
            reference,
            data_type,
            flags,
            type_index,
            data,
        })
    }

    pub fn is_null(&self) -> bool {
        self.reference == 0
            && matches!(
                self.data_type,
                DataType::String | DataType::Object | DataType::Class | DataType::SzArray
            )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.data {
            ValueData::Int(v) => Some(v),
            ValueData::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.data {
            ValueData::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ValueData::Str(s) => Some(s),
            _ => None,
        }
    }
}

fn read_u64(reader: &mut PayloadReader, endian: Endian) -> Result<u64, Error> {
    let a = reader.u32()? as u64;
    let b = reader.u32()? as u64;
    Ok(match endian {
        Endian::Little => a | (b << 32),
        Endian::Big => (a << 32) | b,
    })
}

impl Display for RuntimeValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return f.write_str("null");
        }
        match &self.data {
            ValueData::None => f.write_str("void"),
            ValueData::Bool(v) => write!(f, "{v}"),
            ValueData::Char(v) => write!(f, "'{v}'"),
            ValueData::Int(v) => write!(f, "{v}"),
            ValueData::UInt(v) => write!(f, "{v}"),
            ValueData::Float(v) => write!(f, "{v}"),
            ValueData::Str(v) => write!(f, "\"{v}\""),
            ValueData::Raw(_) => write!(f, "{{{} @ {:#010X}}}", self.data_type, self.reference),
        }
    }
}

/// Stack slot category of `VALUE_GET_STACK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackSlot {
    Argument(u32),
    Local(u32),
    EvalStack(u32),
}

impl StackSlot {
    fn write(self, writer: PayloadWriter) -> PayloadWriter {
        let (kind, index) = match self {
            StackSlot::Argument(i) => (0, i),
            StackSlot::Local(i) => (1, i),
            StackSlot::EvalStack(i) => (2, i),
        };
        writer.u32(kind).u32(index)
    }
}

impl Process {
    fn value_request(
        &self,
        cmd: Command,
        payload: Bytes,
    ) -> Result<Option<RuntimeValue>, Error> {
        let engine = self.engine();
        let Some(mut reader) = engine.request_reader(cmd, payload, "value")? else {
            return Ok(None);
        };
        Ok(Some(RuntimeValue::read(&mut reader, engine.endian())?))
    }

    /// Read argument, local or evaluation stack slot of a frame, `depth` is a device depth.
    pub fn stack_value(&self, pid: u32, depth: u32, slot: StackSlot) -> Result<Option<RuntimeValue>, Error> {
        self.ensure_stopped()?;
        let payload = slot
            .write(self.engine().writer().u32(pid).u32(depth))
            .finish();
        self.value_request(Command::VALUE_GET_STACK, payload)
    }

    /// Read field (given by CLR token of assembly `assembly_idx`) of an object.
    pub fn field_value(
        &self,
        object: &RuntimeValue,
        assembly_idx: u32,
        field_clr: u32,
    ) -> Result<Option<RuntimeValue>, Error> {
        self.ensure_stopped()?;
        let (kind, device) = self.to_device_token(assembly_idx, field_clr)?;
        if kind != TokenKind::FieldDef {
            return Err(Error::TokenNotFound(field_clr));
        }
        let payload = self
            .engine()
            .writer()
            .u32(object.reference)
            .u32(pack_index(assembly_idx, device))
            .finish();
        self.value_request(Command::VALUE_GET_FIELD, payload)
    }

    /// Overwrite primitive value with raw bytes in device byte order.
    pub fn set_value(&self, target: &RuntimeValue, data: &[u8]) -> Result<bool, Error> {
        self.ensure_stopped()?;
        let payload = self
            .engine()
            .writer()
            .u32(target.reference)
            .u32(target.data_type.raw())
            .blob(data)
            .finish();
        self.engine().request_ack(Command::VALUE_SET_BLOCK, payload)
    }

    /// Take a scratch pad slot, the device pad is resized when it is full. A failed
    /// resize leaves the pad at its previous capacity.
    pub fn reserve_slot(&self) -> Result<ScratchSlot, Error> {
        let (slot, grow) = self.state.lock().unwrap().scratch.allocate();
        if let Some(capacity) = grow {
            debug!(target: "process", "resize scratch pad to {capacity}");
            let payload = self.engine().writer().u32(capacity).finish();
            let resized = match self
                .engine()
                .request_ack(Command::VALUE_RESIZE_SCRATCH_PAD, payload)
            {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::Rejected(Command::VALUE_RESIZE_SCRATCH_PAD)),
                Err(e) => Err(e),
            };
            if let Err(e) = resized {
                weak_error!(
                    self.state.lock().unwrap().scratch.cancel_grow(slot),
                    "scratch pad rollback:"
                );
                return Err(e);
            }
        }
        Ok(slot)
    }

    pub fn release_slot(&self, slot: ScratchSlot) -> Result<(), Error> {
        self.state.lock().unwrap().scratch.release(slot)
    }

    pub fn scratch_value(&self, slot: ScratchSlot) -> Result<Option<RuntimeValue>, Error> {
        self.state.lock().unwrap().scratch.validate(slot)?;
        let payload = self.engine().writer().u32(slot.index).finish();
        self.value_request(Command::VALUE_GET_SCRATCH_PAD, payload)
    }

    /// Allocate string on device, the string is kept alive by returned slot.
    pub fn allocate_string(&self, s: &str) -> Result<(ScratchSlot, RuntimeValue), Error> {
        self.ensure_stopped()?;
        let slot = self.reserve_slot()?;
        let payload = self.engine().writer().u32(slot.index).string(s).finish();
        self.allocated(slot, Command::VALUE_ALLOCATE_STRING, payload)
    }

    /// Allocate object of type (CLR token of assembly `assembly_idx`) on device.
    pub fn allocate_object(
        &self,
        assembly_idx: u32,
        type_clr: u32,
    ) -> Result<(ScratchSlot, RuntimeValue), Error> {
        self.ensure_stopped()?;
        let (kind, device) = self.to_device_token(assembly_idx, type_clr)?;
        if kind != TokenKind::TypeDef {
            return Err(Error::TokenNotFound(type_clr));
        }
        let slot = self.reserve_slot()?;
        let payload = self
            .engine()
            .writer()
            .u32(slot.index)
            .u32(pack_index(assembly_idx, device))
            .finish();
        self.allocated(slot, Command::VALUE_ALLOCATE_OBJECT, payload)
    }

    fn allocated(
        &self,
        slot: ScratchSlot,
        cmd: Command,
        payload: Bytes,
    ) -> Result<(ScratchSlot, RuntimeValue), Error> {
        match self.value_request(cmd, payload) {
            Ok(Some(value)) => Ok((slot, value)),
            Ok(None) => {
                _ = self.release_slot(slot);
                Err(Error::Rejected(cmd))
            }
            Err(e) => {
                _ = self.release_slot(slot);
                Err(e)
            }
        }
    }
}
