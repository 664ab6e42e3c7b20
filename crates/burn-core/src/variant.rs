use std::fmt;

/// A typed engine value. Versions are packed as four 16-bit fields, most
/// significant first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Variant {
    #[default]
    None,
    Numeric(i64),
    String(String),
    Version(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    None,
    Numeric,
    String,
    Version,
}

impl Variant {
    pub fn kind(&self) -> VariantKind {
        match self {
            Self::None => VariantKind::None,
            Self::Numeric(_) => VariantKind::Numeric,
            Self::String(_) => VariantKind::String,
            Self::Version(_) => VariantKind::Version,
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Truthiness of a bare value in a condition.
    pub fn as_bool(&self) -> bool {
        match self {
            Self::None => false,
            Self::Numeric(value) => *value != 0,
            Self::String(value) => !value.is_empty(),
            Self::Version(value) => *value != 0,
        }
    }

    pub fn to_numeric(&self) -> Option<i64> {
        match self {
            Self::None => None,
            Self::Numeric(value) => Some(*value),
            Self::String(value) => value.trim().parse::<i64>().ok(),
            Self::Version(value) => i64::try_from(*value).ok(),
        }
    }

    pub fn to_version(&self) -> Option<u64> {
        match self {
            Self::None => None,
            Self::Numeric(value) => u64::try_from(*value).ok(),
            Self::String(value) => parse_version_string(value),
            Self::Version(value) => Some(*value),
        }
    }

    pub fn to_string_value(&self) -> String {
        match self {
            Self::None => String::new(),
            Self::Numeric(value) => value.to_string(),
            Self::String(value) => value.clone(),
            Self::Version(value) => format_version(*value),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_value())
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for Variant {
    fn from(value: i64) -> Self {
        Self::Numeric(value)
    }
}

/// Packs up to four parts into a version value. Missing parts are zero.
pub fn pack_version(parts: &[u16]) -> u64 {
    let mut packed = 0_u64;
    for index in 0..4 {
        let part = parts.get(index).copied().unwrap_or(0) as u64;
        packed |= part << (48 - 16 * index);
    }
    packed
}

pub fn version_parts(version: u64) -> [u16; 4] {
    [
        (version >> 48) as u16,
        (version >> 32) as u16,
        (version >> 16) as u16,
        version as u16,
    ]
}

pub fn format_version(version: u64) -> String {
    let [major, minor, build, revision] = version_parts(version);
    format!("{major}.{minor}.{build}.{revision}")
}

/// Parses `1.2.3.4` (one to four dot-separated parts, each at most 65535).
pub fn parse_version_string(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    if trimmed.is_empty() {
        return None;
    }

    let mut parts = Vec::with_capacity(4);
    for raw in trimmed.split('.') {
        if raw.is_empty() || parts.len() == 4 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        parts.push(raw.parse::<u16>().ok()?);
    }
    Some(pack_version(&parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_four_part_version_most_significant_first() {
        let packed = parse_version_string("1.2.3.4").expect("version must parse");
        assert_eq!(packed, (1 << 48) | (2 << 32) | (3 << 16) | 4);
        assert_eq!(format_version(packed), "1.2.3.4");
    }

    #[test]
    fn short_versions_fill_missing_parts_with_zero() {
        assert_eq!(parse_version_string("2"), Some(2 << 48));
        assert_eq!(parse_version_string("v2.1"), Some((2 << 48) | (1 << 32)));
    }

    #[test]
    fn rejects_malformed_versions() {
        assert_eq!(parse_version_string(""), None);
        assert_eq!(parse_version_string("1..2"), None);
        assert_eq!(parse_version_string("1.2.3.4.5"), None);
        assert_eq!(parse_version_string("65536"), None);
        assert_eq!(parse_version_string("1.x"), None);
    }

    #[test]
    fn bare_value_truthiness() {
        assert!(!Variant::None.as_bool());
        assert!(!Variant::string("").as_bool());
        assert!(Variant::string("0").as_bool());
        assert!(!Variant::Numeric(0).as_bool());
        assert!(Variant::Numeric(-1).as_bool());
        assert!(!Variant::Version(0).as_bool());
        assert!(Variant::Version(1).as_bool());
    }
}
