use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};

pub mod api;
pub mod config;
pub mod errors;
pub mod proto;
pub mod utils;

/// A package name, case-normalized the way the upstream index does it:
/// lowercased, with every run of `-`, `_` and `.` collapsed to a single `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PkgName(String);

impl PkgName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl FromStr for PkgName {
    type Err = Error;

    fn from_str(s: &str) -> Result<PkgName> {
        let mut name = String::with_capacity(s.len());
        let mut dash = false;
        for c in s.chars() {
            match c {
                'a'..='z' | '0'..='9' => {
                    name.push(c);
                    dash = false;
                }
                'A'..='Z' => {
                    name.push(c.to_ascii_lowercase());
                    dash = false;
                }
                '-' | '_' | '.' => {
                    if !dash && !name.is_empty() {
                        name.push('-');
                    }
                    dash = true;
                }
                _ => bail!("Invalid character in package name: {:?}", s),
            }
        }
        if name.ends_with('-') {
            name.pop();
        }
        if name.is_empty() {
            bail!("Package name is empty: {:?}", s);
        }
        Ok(PkgName(name))
    }
}

impl fmt::Display for PkgName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Deref for PkgName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize, Deserialize)]
pub enum BuildStatus {
    #[strum(serialize = "ok")]
    #[serde(rename = "ok")]
    Success,
    #[strum(serialize = "fail")]
    #[serde(rename = "fail")]
    Failure,
}

impl BuildStatus {
    pub fn is_success(self) -> bool {
        self == BuildStatus::Success
    }
}

/// Tool a build dependency belongs to. The empty tool marks dependencies
/// recorded without attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyTool {
    #[serde(rename = "apt")]
    Apt,
    #[serde(rename = "pip")]
    Pip,
    #[serde(rename = "")]
    Unspecified,
}

impl DependencyTool {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyTool::Apt => "apt",
            DependencyTool::Pip => "pip",
            DependencyTool::Unspecified => "",
        }
    }
}

impl FromStr for DependencyTool {
    type Err = Error;

    fn from_str(s: &str) -> Result<DependencyTool> {
        match s {
            "apt" => Ok(DependencyTool::Apt),
            "pip" => Ok(DependencyTool::Pip),
            "" => Ok(DependencyTool::Unspecified),
            _ => bail!("Unknown dependency tool: {:?}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub tool: DependencyTool,
    pub dependency: String,
}

/// The five tag components of a wheel filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelTags {
    pub package_tag: String,
    pub package_version_tag: String,
    pub py_version_tag: String,
    pub abi_tag: String,
    pub platform_tag: String,
}

impl WheelTags {
    /// Parses `pkg-version[-build]-py-abi-platform.whl`. The optional build
    /// tag is folded into the version tag, matching how the files are
    /// indexed.
    pub fn from_filename(filename: &str) -> Result<WheelTags> {
        let stem = filename
            .strip_suffix(".whl")
            .ok_or_else(|| format_err!("Not a wheel filename: {:?}", filename))?;
        let parts: Vec<&str> = stem.split('-').collect();
        let (package_tag, version_tag, rest) = match parts.len() {
            5 => (parts[0], parts[1].to_string(), &parts[2..]),
            6 => (parts[0], format!("{}-{}", parts[1], parts[2]), &parts[3..]),
            _ => bail!("Unexpected wheel filename structure: {:?}", filename),
        };
        if package_tag.is_empty() || version_tag.is_empty() {
            bail!("Unexpected wheel filename structure: {:?}", filename);
        }
        Ok(WheelTags {
            package_tag: package_tag.to_string(),
            package_version_tag: version_tag,
            py_version_tag: rest[0].to_string(),
            abi_tag: rest[1].to_string(),
            platform_tag: rest[2].to_string(),
        })
    }
}

/// One artifact produced by a build, as reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelFile {
    pub filename: String,
    pub filesize: u64,
    pub filehash: String,
    #[serde(flatten)]
    pub tags: WheelTags,
    pub dependencies: Vec<Dependency>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("foo", "foo")]
    #[case("Foo", "foo")]
    #[case("foo_bar", "foo-bar")]
    #[case("foo...bar", "foo-bar")]
    #[case("Foo__Bar-baz", "foo-bar-baz")]
    #[case("-foo-", "foo")]
    fn normalizes_package_names(#[case] input: &str, #[case] expected: &str) {
        let name: PkgName = input.parse().unwrap();
        assert_eq!(name.as_str(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("---")]
    #[case("foo bar")]
    #[case("foo/bar")]
    fn rejects_invalid_package_names(#[case] input: &str) {
        assert!(input.parse::<PkgName>().is_err());
    }

    #[test]
    fn parses_wheel_filename() {
        let tags = WheelTags::from_filename("foo-1.0-cp39-cp39-linux_armv7l.whl").unwrap();
        assert_eq!(tags.package_tag, "foo");
        assert_eq!(tags.package_version_tag, "1.0");
        assert_eq!(tags.py_version_tag, "cp39");
        assert_eq!(tags.abi_tag, "cp39");
        assert_eq!(tags.platform_tag, "linux_armv7l");
    }

    #[test]
    fn parses_wheel_filename_with_build_tag() {
        let tags = WheelTags::from_filename("foo-1.0-1-py2.py3-none-any.whl").unwrap();
        assert_eq!(tags.package_version_tag, "1.0-1");
        assert_eq!(tags.py_version_tag, "py2.py3");
        assert_eq!(tags.abi_tag, "none");
        assert_eq!(tags.platform_tag, "any");
    }

    #[rstest]
    #[case("foo-1.0.tar.gz")]
    #[case("foo-1.0.whl")]
    #[case("foo.whl")]
    #[case("-1.0-cp39-cp39-any.whl")]
    fn rejects_malformed_wheel_filenames(#[case] input: &str) {
        assert!(WheelTags::from_filename(input).is_err());
    }

    #[test]
    fn build_status_round_trips_as_str() {
        assert_eq!(BuildStatus::Success.to_string(), "ok");
        assert_eq!("fail".parse::<BuildStatus>().unwrap(), BuildStatus::Failure);
    }
}
