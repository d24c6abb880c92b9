use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLsnError(pub String);

impl fmt::Display for ParseLsnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid LSN: {}", self.0)
    }
}
impl std::error::Error for ParseLsnError {}

/// Log sequence number: a byte position in the server's write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// `0/0`, the invalid position. Asking the server to start here means
    /// "resume from the slot's confirmed position".
    pub const ZERO: Lsn = Lsn(0);

    /// Parse PostgreSQL's `XXXXXXXX/XXXXXXXX` text form.
    pub fn parse(s: &str) -> Result<Lsn, ParseLsnError> {
        let (hi, lo) = s.split_once('/').ok_or_else(|| ParseLsnError(s.into()))?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(ParseLsnError(s.into()));
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError(s.into()))?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError(s.into()))?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }

    pub fn to_pg_string(self) -> String {
        format!("{:X}/{:X}", (self.0 >> 32) as u32, self.0 as u32)
    }

    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Lsn::parse(s)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_pg_string())
    }
}
