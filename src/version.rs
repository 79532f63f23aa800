use crate::error::Error;
use crate::wire::PayloadReader;
use crate::weak_error;
use itertools::Itertools;
use std::fmt::{Display, Formatter};

/// Four-part version (major, minor, build, revision) as reported by a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version(pub (u16, u16, u16, u16));

impl Version {
    /// Parse version from strings like "1.2", "4.3.1" or "1.0.0.12".
    /// Missing parts are zero.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<u16> = s
            .trim()
            .split('.')
            .map(|p| weak_error!(p.parse::<u16>()))
            .collect::<Option<_>>()?;
        if parts.is_empty() || parts.len() > 4 {
            return None;
        }
        let part = |i: usize| parts.get(i).copied().unwrap_or_default();
        Some(Version((part(0), part(1), part(2), part(3))))
    }

    pub(crate) fn read(reader: &mut PayloadReader) -> Result<Self, Error> {
        Ok(Version((
            reader.u16()?,
            reader.u16()?,
            reader.u16()?,
            reader.u16()?,
        )))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (a, b, c, d) = self.0;
        f.write_str(&[a, b, c, d].iter().join("."))
    }
}
