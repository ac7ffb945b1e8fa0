//! Semantic firmware versions (`major.minor.patch`), compared field by field
//! as numbers.
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl FirmwareVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
    }
}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionParseError(pub String);

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid firmware version {:?}", self.0)
    }
}

impl std::error::Error for VersionParseError {}

/// Leading decimal digits of a field (`"0-beta"` -> 0). `None` when the field
/// does not start with a digit.
fn leading_number(field: &str) -> Option<u32> {
    let digits: String = field.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

impl FromStr for FirmwareVersion {
    type Err = VersionParseError;

    /// Accepts `1.2.3`, `v1.2.3`, `1.2` (patch 0) and suffixed patches such as
    /// `1.2.3-rc1`. Each present field must start with a digit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        let err = || VersionParseError(s.to_string());
        let mut fields = body.split('.');
        let major = fields.next().and_then(leading_number).ok_or_else(err)?;
        let minor = match fields.next() {
            Some(f) => leading_number(f).ok_or_else(err)?,
            None => 0,
        };
        let patch = match fields.next() {
            Some(f) => leading_number(f).ok_or_else(err)?,
            None => 0,
        };
        Ok(FirmwareVersion::new(major, minor, patch))
    }
}

/// True when `latest` is strictly newer than `current`.
///
/// An unparseable `latest` never triggers an update. An unparseable `current`
/// is treated as older than any valid `latest`.
pub fn is_newer(current: &str, latest: &str) -> bool {
    let Ok(latest) = latest.parse::<FirmwareVersion>() else {
        return false;
    };
    match current.parse::<FirmwareVersion>() {
        Ok(current) => latest > current,
        Err(_) => true,
    }
}
