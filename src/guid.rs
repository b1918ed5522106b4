use std::fmt::{self, Debug, Display};
use std::io::{self, Read};
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::err::DeserializationError;

/// A Windows GUID, displayed the way the event log renders it: `{XXXXXXXX-XXXX-...}`.
#[derive(PartialOrd, Ord, PartialEq, Eq, Hash, Clone, Copy, Default)]
pub struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Guid {
        Guid {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub fn from_reader<R: Read>(stream: &mut R) -> io::Result<Guid> {
        let data1 = stream.read_u32::<LittleEndian>()?;
        let data2 = stream.read_u16::<LittleEndian>()?;
        let data3 = stream.read_u16::<LittleEndian>()?;
        let mut data4 = [0; 8];
        stream.read_exact(&mut data4)?;
        Ok(Guid::new(data1, data2, data3, data4))
    }

    pub fn from_bytes(bytes: &[u8; 16]) -> Guid {
        let data1 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let data2 = u16::from_le_bytes([bytes[4], bytes[5]]);
        let data3 = u16::from_le_bytes([bytes[6], bytes[7]]);
        let mut data4 = [0; 8];
        data4.copy_from_slice(&bytes[8..16]);
        Guid::new(data1, data2, data3, data4)
    }

    /// The in-memory (little-endian) layout.
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }

    pub fn is_nil(&self) -> bool {
        *self == Guid::default()
    }
}

impl FromStr for Guid {
    type Err = DeserializationError;

    /// Accepts the braced and the bare 8-4-4-4-12 forms, in any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeserializationError::InvalidGuid(s.to_owned());
        let trimmed = s.trim();
        let bare = trimmed
            .strip_prefix('{')
            .and_then(|t| t.strip_suffix('}'))
            .unwrap_or(trimmed);

        let parts: Vec<&str> = bare.split('-').collect();
        let [p1, p2, p3, p4, p5] = parts.as_slice() else {
            return Err(invalid());
        };
        if p1.len() != 8 || p2.len() != 4 || p3.len() != 4 || p4.len() != 4 || p5.len() != 12 {
            return Err(invalid());
        }

        let data1 = u32::from_str_radix(p1, 16).map_err(|_| invalid())?;
        let data2 = u16::from_str_radix(p2, 16).map_err(|_| invalid())?;
        let data3 = u16::from_str_radix(p3, 16).map_err(|_| invalid())?;
        let tail = format!("{p4}{p5}");
        let mut data4 = [0u8; 8];
        for (i, byte) in data4.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&tail[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Guid::new(data1, data2, data3, data4))
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7]
        )
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}
