//! Normalized OS/Arch/Variant platform triples.
//!
//! Platforms arrive as free-form strings (`linux/amd64`, `arm64`,
//! `linux/arm/v7`) and are normalized once at the boundary; everything past
//! the parser compares normalized values only.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::Error;

/// Describes the platform a node can produce images for, as an OS, CPU
/// architecture, and optional CPU variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    /// The operating system, for example `linux` or `windows`.
    pub os: String,
    /// The CPU architecture, for example `amd64` or `riscv64`.
    pub architecture: String,
    /// Optional CPU variant, for example `v7` when architecture is `arm`.
    pub variant: Option<String>,
}

impl Platform {
    /// Parse and normalize a platform string.
    ///
    /// A missing OS segment defaults to `linux`. Empty segments are
    /// rejected.
    pub fn parse(spec: &str) -> Result<Platform, Error> {
        if spec.trim().is_empty() {
            return Err(Error::invalid("platform specifier is empty"));
        }
        let parts: Vec<&str> = spec.trim().split('/').collect();
        if parts.iter().any(|p| p.is_empty()) || parts.len() > 3 {
            return Err(Error::invalid(format!("invalid platform '{spec}'")));
        }
        let (os, arch, variant) = match parts.as_slice() {
            [arch] => ("linux", *arch, None),
            [os, arch] => (*os, *arch, None),
            [os, arch, variant] => (*os, *arch, Some(*variant)),
            _ => unreachable!(),
        };
        Ok(Platform {
            os: os.to_ascii_lowercase(),
            architecture: arch.to_ascii_lowercase(),
            variant: variant.map(str::to_ascii_lowercase),
        }
        .normalize())
    }

    /// Fold well-known aliases into their canonical triple.
    pub fn normalize(self) -> Platform {
        let Platform {
            os,
            architecture,
            variant,
        } = self;
        let (architecture, variant) = match (architecture.as_str(), variant.as_deref()) {
            ("x86_64" | "x86-64" | "amd64", None | Some("v1")) => ("amd64".into(), None),
            ("i386" | "i686" | "x86", _) => ("386".into(), None),
            ("aarch64" | "arm64v8", _) | ("arm64", None | Some("v8")) => ("arm64".into(), None),
            ("armv8", _) => ("arm64".into(), None),
            ("armv7" | "armhf", _) | ("arm", None) => ("arm".into(), Some("v7".into())),
            ("armv6" | "armel", _) => ("arm".into(), Some("v6".into())),
            ("armv5", _) => ("arm".into(), Some("v5".into())),
            _ => (architecture.clone(), variant.clone()),
        };
        Platform {
            os,
            architecture,
            variant,
        }
    }

    /// Parse a comma separated list of platform strings.
    pub fn parse_list(specs: &str) -> Result<Vec<Platform>, Error> {
        specs
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Platform::parse)
            .collect()
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Platform, Error> {
        Platform::parse(s)
    }
}

impl Serialize for Platform {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D>(deserializer: D) -> Result<Platform, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Platform::parse(&value).map_err(de::Error::custom)
    }
}

/// How tightly a requested platform must line up with a declared one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Matcher {
    /// Only a normalized-equal triple matches.
    Strict,
    /// Equal triples match, and an arm64 or higher-variant arm node also
    /// covers lower arm variants.
    #[default]
    Only,
}

impl Matcher {
    /// Whether a node declaring `have` can take on a request for `want`.
    pub fn matches(&self, have: &Platform, want: &Platform) -> bool {
        if have == want {
            return true;
        }
        match self {
            Matcher::Strict => false,
            Matcher::Only => {
                if have.os != want.os {
                    return false;
                }
                if want.architecture != "arm" {
                    return false;
                }
                let want_variant = arm_variant_rank(want.variant.as_deref());
                match have.architecture.as_str() {
                    // A 64-bit arm node runs 32-bit arm payloads.
                    "arm64" => want_variant <= arm_variant_rank(Some("v8")),
                    "arm" => arm_variant_rank(have.variant.as_deref()) >= want_variant,
                    _ => false,
                }
            }
        }
    }

    /// Whether the match is exact rather than variant fallback.
    pub fn exact(&self, have: &Platform, want: &Platform) -> bool {
        have == want
    }
}

fn arm_variant_rank(variant: Option<&str>) -> u8 {
    match variant {
        Some("v5") => 5,
        Some("v6") => 6,
        None | Some("v7") => 7,
        Some("v8") => 8,
        _ => 0,
    }
}

/// Format a platform list the way inspect output and logs do, comma
/// separated.
pub fn format_list(platforms: &[Platform]) -> String {
    platforms
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes_aliases() {
        assert_eq!(Platform::parse("x86_64").unwrap().to_string(), "linux/amd64");
        assert_eq!(
            Platform::parse("linux/aarch64").unwrap().to_string(),
            "linux/arm64"
        );
        assert_eq!(
            Platform::parse("linux/arm64/v8").unwrap().to_string(),
            "linux/arm64"
        );
        assert_eq!(
            Platform::parse("linux/armv7").unwrap().to_string(),
            "linux/arm/v7"
        );
        assert_eq!(Platform::parse("arm").unwrap().to_string(), "linux/arm/v7");
        assert_eq!(
            Platform::parse("windows/amd64").unwrap().to_string(),
            "windows/amd64"
        );
    }

    #[test]
    fn rejects_malformed_specifiers() {
        assert!(Platform::parse("").is_err());
        assert!(Platform::parse("linux//v7").is_err());
        assert!(Platform::parse("linux/arm/v7/extra").is_err());
    }

    #[test]
    fn strict_requires_equality() {
        let m = Matcher::Strict;
        let arm64 = Platform::parse("linux/arm64").unwrap();
        let v7 = Platform::parse("linux/arm/v7").unwrap();
        assert!(m.matches(&arm64, &arm64));
        assert!(!m.matches(&arm64, &v7));
    }

    #[test]
    fn only_allows_arm_fallback() {
        let m = Matcher::Only;
        let arm64 = Platform::parse("linux/arm64").unwrap();
        let v8 = Platform::parse("linux/arm/v8").unwrap();
        let v7 = Platform::parse("linux/arm/v7").unwrap();
        let v6 = Platform::parse("linux/arm/v6").unwrap();
        let amd64 = Platform::parse("linux/amd64").unwrap();

        assert!(m.matches(&arm64, &v7));
        assert!(m.matches(&v8, &v7));
        assert!(m.matches(&v7, &v6));
        assert!(!m.matches(&v6, &v7));
        assert!(!m.matches(&amd64, &v7));
        assert!(!m.matches(&arm64, &amd64));
    }

    #[test]
    fn serde_round_trips_as_strings() {
        let p = Platform::parse("linux/arm/v6").unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"linux/arm/v6\"");
        let back: Platform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn parses_comma_separated_lists() {
        let list = Platform::parse_list("linux/amd64,linux/arm64").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(format_list(&list), "linux/amd64,linux/arm64");
    }
}
