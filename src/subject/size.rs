//! iperf-style file size specifiers (`<int>[K|M|G]`, binary units).

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static SIZE_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^([0-9]+)([KMG])?$").expect("file size pattern is valid")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    #[error("Invalid file size specifier: '{0}'")]
    Invalid(String),

    #[error("File size specifier '{0}' overflows")]
    Overflow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeUnit {
    Bytes,
    Kilo,
    Mega,
    Giga,
}

impl SizeUnit {
    fn multiplier(self) -> u64 {
        match self {
            SizeUnit::Bytes => 1,
            SizeUnit::Kilo => 1 << 10,
            SizeUnit::Mega => 1 << 20,
            SizeUnit::Giga => 1 << 30,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            SizeUnit::Bytes => "B",
            SizeUnit::Kilo => "K",
            SizeUnit::Mega => "M",
            SizeUnit::Giga => "G",
        }
    }
}

/// A parsed size specifier such as `10M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSize {
    value: u64,
    unit: SizeUnit,
    bytes: u64,
}

impl FileSize {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Name of the cached payload file, e.g. `10M.dat` or `512B.dat`.
    pub fn file_name(&self) -> String {
        format!("{}{}.dat", self.value, self.unit.suffix())
    }
}

impl FromStr for FileSize {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = SIZE_SPEC
            .captures(s)
            .ok_or_else(|| SizeError::Invalid(s.to_string()))?;

        let value: u64 = caps[1]
            .parse()
            .map_err(|_| SizeError::Overflow(s.to_string()))?;
        let unit = match caps.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
            None => SizeUnit::Bytes,
            Some(u) if u == "K" => SizeUnit::Kilo,
            Some(u) if u == "M" => SizeUnit::Mega,
            Some(_) => SizeUnit::Giga,
        };
        let bytes = value
            .checked_mul(unit.multiplier())
            .ok_or_else(|| SizeError::Overflow(s.to_string()))?;

        Ok(Self { value, unit, bytes })
    }
}

impl fmt::Display for FileSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            SizeUnit::Bytes => write!(f, "{}", self.value),
            unit => write!(f, "{}{}", self.value, unit.suffix()),
        }
    }
}
