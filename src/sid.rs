use std::fmt;
use std::str::FromStr;

use crate::err::DeserializationError;

/// A security identifier in its serialized binary form.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Sid {
    bytes: Vec<u8>,
}

impl Sid {
    /// Wrap already validated SID bytes (see `ByteCursor::sid_bytes`).
    pub(crate) fn from_validated_bytes(bytes: &[u8]) -> Self {
        Sid {
            bytes: bytes.to_vec(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn revision(&self) -> u8 {
        self.bytes[0]
    }

    /// IdentifierAuthority is a 48-bit big-endian integer.
    pub fn authority(&self) -> u64 {
        self.bytes[2..8]
            .iter()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
    }

    pub fn sub_authorities(&self) -> impl Iterator<Item = u32> + '_ {
        self.bytes[8..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }
}

impl FromStr for Sid {
    type Err = DeserializationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DeserializationError::InvalidSid(s.to_owned());
        let mut parts = s
            .strip_prefix("S-")
            .or_else(|| s.strip_prefix("s-"))
            .ok_or_else(invalid)?
            .split('-');

        let revision: u8 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let authority = parts
            .next()
            .and_then(|p| match p.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => p.parse().ok(),
            })
            .filter(|a: &u64| *a < (1 << 48))
            .ok_or_else(invalid)?;
        let subs = parts
            .map(|p| p.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        if subs.len() > 15 {
            return Err(invalid());
        }

        let mut bytes = Vec::with_capacity(8 + subs.len() * 4);
        bytes.push(revision);
        bytes.push(subs.len() as u8);
        bytes.extend_from_slice(&authority.to_be_bytes()[2..8]);
        for sub in subs {
            bytes.extend_from_slice(&sub.to_le_bytes());
        }
        Ok(Sid { bytes })
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-{}", self.revision(), self.authority())?;
        for sub in self.sub_authorities() {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The kind of account a SID maps to (`SID_NAME_USE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidType {
    User = 1,
    Group,
    Domain,
    Alias,
    WellKnownGroup,
    DeletedAccount,
    Invalid,
    Unknown,
    Computer,
    Label,
    LogonSession,
}

impl SidType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SidType::User => "User",
            SidType::Group => "Group",
            SidType::Domain => "Domain",
            SidType::Alias => "Alias",
            SidType::WellKnownGroup => "Well Known Group",
            SidType::DeletedAccount => "Deleted Account",
            SidType::Invalid => "Invalid",
            SidType::Unknown => "Unknown",
            SidType::Computer => "Computer",
            SidType::Label => "Label",
            SidType::LogonSession => "Logon Session",
        }
    }
}

impl fmt::Display for SidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of resolving a SID to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub domain: String,
    pub sid_type: SidType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_roundtrip_string() {
        let sid: Sid = "S-1-5-21-3541430928-2051711210-1391384369-1001"
            .parse()
            .unwrap();
        assert_eq!(sid.revision(), 1);
        assert_eq!(sid.authority(), 5);
        assert_eq!(sid.as_bytes().len(), 8 + 5 * 4);
        assert_eq!(
            sid.to_string(),
            "S-1-5-21-3541430928-2051711210-1391384369-1001"
        );
    }

    #[test]
    fn test_sid_binary_layout() {
        let sid: Sid = "S-1-5-18".parse().unwrap();
        assert_eq!(
            sid.as_bytes(),
            &[1, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0][..]
        );
    }

    #[test]
    fn test_invalid_sid() {
        assert!("X-1-5".parse::<Sid>().is_err());
        assert!("S-1-5-abc".parse::<Sid>().is_err());
        assert!("S-1".parse::<Sid>().is_err());
    }
}
