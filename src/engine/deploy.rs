//! Deployment of an application image into device flash.

use crate::engine::{CapabilityFlags, Engine};
use crate::error::Error;
use crate::wire::packet::crc32_update;
use crate::wire::{Command, PayloadReader};
use log::{debug, info};

const USAGE_MASK: u32 = 0xF0;
const USAGE_DEPLOYMENT: u32 = 0x50;
const ERASED_BYTE: u8 = 0xFF;

/// Flash sector as reported by `FLASH_SECTOR_MAP`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashSector {
    pub start: u32,
    pub length: u32,
    pub usage: u32,
}

impl FlashSector {
    pub fn is_deployment(&self) -> bool {
        self.usage & USAGE_MASK == USAGE_DEPLOYMENT
    }

    fn read(reader: &mut PayloadReader) -> Result<Self, Error> {
        Ok(FlashSector {
            start: reader.u32()?,
            length: reader.u32()?,
            usage: reader.u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeployReport {
    /// Sector-level update was used.
    pub incremental: bool,
    pub sectors_erased: usize,
    /// Sectors that already hold the expected content.
    pub sectors_skipped: usize,
    pub bytes_written: usize,
}

/// CRC of a sector after writing `content` into it, the rest of the sector stays erased.
pub fn expected_sector_crc(content: &[u8], sector_len: usize) -> u32 {
    let mut crc = crc32_update(0, content);
    let padding = [ERASED_BYTE; 256];
    let mut left = sector_len.saturating_sub(content.len());
    while left > 0 {
        let n = left.min(padding.len());
        crc = crc32_update(crc, &padding[..n]);
        left -= n;
    }
    crc
}

impl Engine {
    pub fn flash_sector_map(&self) -> Result<Vec<FlashSector>, Error> {
        let Some(mut reader) =
            self.request_reader(Command::FLASH_SECTOR_MAP, bytes::Bytes::new(), "flash sector map")?
        else {
            return Ok(vec![]);
        };
        let mut sectors = vec![];
        while !reader.is_empty() {
            sectors.push(FlashSector::read(&mut reader)?);
        }
        Ok(sectors)
    }

    /// CRC of a memory region, `None` if device does not answer.
    pub fn check_memory(&self, address: u32, length: u32) -> Result<Option<u32>, Error> {
        let payload = self.writer().u32(address).u32(length).finish();
        let Some(mut reader) = self.request_reader(Command::CHECK_MEMORY, payload, "check memory")?
        else {
            return Ok(None);
        };
        Ok(Some(reader.u32()?))
    }

    pub fn erase_memory(&self, address: u32, length: u32) -> Result<(), Error> {
        let payload = self.writer().u32(address).u32(length).finish();
        if !self.request_ack(Command::ERASE_MEMORY, payload)? {
            return Err(Error::Rejected(Command::ERASE_MEMORY));
        }
        Ok(())
    }

    /// Write `data` at `address` in chunks of configured size.
    pub fn write_memory(&self, address: u32, data: &[u8]) -> Result<(), Error> {
        let chunk_size = self.config().deploy.chunk_size.max(1);
        for (i, chunk) in data.chunks(chunk_size).enumerate() {
            let chunk_address = address + (i * chunk_size) as u32;
            let payload = self
                .writer()
                .u32(chunk_address)
                .u32(chunk.len() as u32)
                .bytes(chunk)
                .finish();
            if !self.request_ack(Command::WRITE_MEMORY, payload)? {
                return Err(Error::Rejected(Command::WRITE_MEMORY));
            }
        }
        Ok(())
    }

    /// Deploy image into deployment sectors.
    ///
    /// Devices with incremental deployment capability get a sector-level update:
    /// only sectors whose CRC differs from expected are erased and written.
    /// Otherwise whole deployment storage is erased and overwritten.
    pub fn deploy(&self, image: &[u8]) -> Result<DeployReport, Error> {
        let sectors: Vec<_> = self
            .flash_sector_map()?
            .into_iter()
            .filter(FlashSector::is_deployment)
            .collect();
        if sectors.is_empty() {
            return Err(Error::NoDeploymentStorage);
        }

        let available: usize = sectors.iter().map(|s| s.length as usize).sum();
        if image.len() > available {
            return Err(Error::InsufficientStorage {
                required: image.len(),
                available,
            });
        }

        let incremental = self.supports(CapabilityFlags::INCREMENTAL_DEPLOYMENT);
        let mut report = DeployReport {
            incremental,
            ..DeployReport::default()
        };

        let mut offset = 0;
        for sector in &sectors {
            let len = sector.length as usize;
            let content = &image[offset.min(image.len())..(offset + len).min(image.len())];
            offset += len;

            if incremental {
                let expected = expected_sector_crc(content, len);
                if self.check_memory(sector.start, sector.length)? == Some(expected) {
                    debug!(target: "engine", "sector {:#010X} is up to date", sector.start);
                    report.sectors_skipped += 1;
                    continue;
                }
            }

            self.erase_memory(sector.start, sector.length)?;
            report.sectors_erased += 1;
            if !content.is_empty() {
                self.write_memory(sector.start, content)?;
                report.bytes_written += content.len();
            }
        }

        info!(
            target: "engine",
            "deploy complete: {} bytes written, {} sectors erased, {} skipped",
            report.bytes_written, report.sectors_erased, report.sectors_skipped
        );
        Ok(report)
    }
}
