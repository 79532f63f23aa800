use crate::error::Error;
use crate::version::Version;
use crate::wire::PayloadReader;
use bitflags::bitflags;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CapabilityFlags: u32 {
        const FLOATING_POINT = 0x0000_0001;
        const SOURCE_LEVEL_DEBUGGING = 0x0000_0002;
        const APP_DOMAINS = 0x0000_0004;
        const EXCEPTION_FILTERS = 0x0000_0008;
        const INCREMENTAL_DEPLOYMENT = 0x0000_0010;
        const SOFT_REBOOT = 0x0000_0020;
        const PROFILING = 0x0000_0040;
        const PROFILING_ALLOCATIONS = 0x0000_0080;
        const PROFILING_CALLS = 0x0000_0100;
        const THREAD_CREATE_EX = 0x0000_0400;
    }
}

/// Capability category, one query per category is issued while negotiating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
#[repr(u32)]
pub enum CapabilityCategory {
    Flags = 1,
    Lcd = 2,
    SoftwareVersion = 3,
    HalSystemInfo = 5,
    ClrInfo = 6,
    SolutionReleaseInfo = 7,
}

impl CapabilityCategory {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::iter().find(|c| *c as u32 == raw)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LcdInfo {
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SoftwareVersion {
    pub build_date: String,
    pub compiler_info: String,
    pub compiler_version: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HalSystemInfo {
    pub version: Version,
    pub vendor: String,
    pub oem: u8,
    pub model: u8,
    pub sku: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClrInfo {
    pub clr_version: Version,
    pub target_framework: Version,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SolutionInfo {
    pub version: Version,
    pub vendor: String,
}

/// Device feature set. Negotiated once per connection, see [`crate::Engine::connect`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClrCapabilities {
    pub flags: CapabilityFlags,
    pub lcd: Option<LcdInfo>,
    pub software_version: Option<SoftwareVersion>,
    pub hal: Option<HalSystemInfo>,
    pub clr: Option<ClrInfo>,
    pub solution: Option<SolutionInfo>,
}

impl ClrCapabilities {
    #[inline(always)]
    pub fn supports(&self, flag: CapabilityFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Fill category data from a reply payload.
    pub(crate) fn apply(
        &mut self,
        category: CapabilityCategory,
        reader: &mut PayloadReader,
    ) -> Result<(), Error> {
        match category {
            CapabilityCategory::Flags => {
                self.flags = CapabilityFlags::from_bits_retain(reader.u32()?);
            }
            CapabilityCategory::Lcd => {
                self.lcd = Some(LcdInfo {
                    width: reader.u32()?,
                    height: reader.u32()?,
                    bits_per_pixel: reader.u32()?,
                });
            }
            CapabilityCategory::SoftwareVersion => {
                self.software_version = Some(SoftwareVersion {
                    build_date: reader.string()?,
                    compiler_info: reader.string()?,
                    compiler_version: reader.u32()?,
                });
            }
            CapabilityCategory::HalSystemInfo => {
                self.hal = Some(HalSystemInfo {
                    version: Version::read(reader)?,
                    vendor: reader.string()?,
                    oem: reader.u8()?,
                    model: reader.u8()?,
                    sku: reader.u16()?,
                });
            }
            CapabilityCategory::ClrInfo => {
                self.clr = Some(ClrInfo {
                    clr_version: Version::read(reader)?,
                    target_framework: Version::read(reader)?,
                });
            }
            CapabilityCategory::SolutionReleaseInfo => {
                self.solution = Some(SolutionInfo {
                    version: Version::read(reader)?,
                    vendor: reader.string()?,
                });
            }
        }
        Ok(())
    }
}
