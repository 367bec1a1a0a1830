// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian package version strings and their ordering.

Domination ranks publications by version, so the ordering here must agree
exactly with `dpkg --compare-versions`. See
<https://www.debian.org/doc/debian-policy/ch-controlfields.html#version>.
*/

use {
    serde::{Deserialize, Serialize},
    std::{
        cmp::Ordering,
        fmt::{Display, Formatter},
        num::ParseIntError,
        str::FromStr,
    },
    thiserror::Error,
};

#[derive(Clone, Debug, Error)]
pub enum VersionError {
    #[error("error parsing string to integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("version string is empty")]
    Empty,

    #[error("the epoch component has non-digit characters: {0}")]
    EpochNonNumeric(String),

    #[error("upstream_version component has illegal character: {0}")]
    UpstreamVersionIllegalChar(String),

    #[error("debian_revision component has illegal character: {0}")]
    DebianRevisionIllegalChar(String),
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// A Debian package version.
///
/// The format is `[epoch:]upstream_version[-debian_revision]`.
///
/// Equality is structural (`1.0` and `0:1.0` are not equal) while ordering follows
/// dpkg, where they compare as [Ordering::Equal].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageVersion {
    epoch: Option<u32>,
    upstream_version: String,
    debian_revision: Option<String>,
}

impl PackageVersion {
    /// Construct an instance by parsing a version string.
    pub fn parse(s: &str) -> Result<Self> {
        // Epoch is the part before the first colon. The revision follows the last hyphen.
        let (epoch, remainder) = match s.split_once(':') {
            Some((epoch, remainder)) => (Some(epoch), remainder),
            None => (None, s),
        };

        let (upstream, debian) = match remainder.rsplit_once('-') {
            Some((upstream, debian)) => (upstream, Some(debian)),
            None => (remainder, None),
        };

        if upstream.is_empty() {
            return Err(VersionError::Empty);
        }

        let epoch = if let Some(epoch) = epoch {
            if epoch.is_empty() || !epoch.chars().all(|c| c.is_ascii_digit()) {
                return Err(VersionError::EpochNonNumeric(s.to_string()));
            }

            Some(u32::from_str(epoch)?)
        } else {
            None
        };

        // Hyphens are only legal in upstream_version when a debian_revision is present.
        if !upstream.chars().all(|c| match c {
            c if c.is_ascii_alphanumeric() => true,
            '.' | '+' | '~' => true,
            '-' => debian.is_some(),
            ':' => epoch.is_some(),
            _ => false,
        }) {
            return Err(VersionError::UpstreamVersionIllegalChar(s.to_string()));
        }

        let debian_revision = if let Some(debian) = debian {
            if debian.is_empty()
                || !debian.chars().all(|c| match c {
                    c if c.is_ascii_alphanumeric() => true,
                    '+' | '.' | '~' => true,
                    _ => false,
                })
            {
                return Err(VersionError::DebianRevisionIllegalChar(s.to_string()));
            }

            Some(debian.to_string())
        } else {
            None
        };

        Ok(Self {
            epoch,
            upstream_version: upstream.to_string(),
            debian_revision,
        })
    }

    /// The `epoch` component, if explicitly present.
    pub fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// The `epoch` component, with `0` assumed when absent.
    pub fn epoch_assumed(&self) -> u32 {
        self.epoch.unwrap_or(0)
    }

    pub fn upstream_version(&self) -> &str {
        &self.upstream_version
    }

    pub fn debian_revision(&self) -> Option<&str> {
        self.debian_revision.as_deref()
    }
}

impl Display for PackageVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(epoch) = self.epoch {
            write!(f, "{}:", epoch)?;
        }

        f.write_str(&self.upstream_version)?;

        if let Some(revision) = &self.debian_revision {
            write!(f, "-{}", revision)?;
        }

        Ok(())
    }
}

impl FromStr for PackageVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PackageVersion {
    type Error = VersionError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<PackageVersion> for String {
    fn from(v: PackageVersion) -> Self {
        v.to_string()
    }
}

/// Weight of a non-digit character.
///
/// Tilde sorts before everything, even the end of the string. Letters sort before
/// all other non-digits. `None` represents the end of the string.
fn char_order(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(b'~') => -1,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(c) => c as i32 + 256,
    }
}

/// Compare a version component string using Debian rules.
///
/// Alternates between a run of non-digits, compared with [char_order], and a run of
/// digits, compared numerically, until both inputs are exhausted.
fn compare_component(a: &str, b: &str) -> Ordering {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let (mut i, mut j) = (0, 0);

    let is_digit = |s: &[u8], pos: usize| s.get(pos).map_or(false, |c| c.is_ascii_digit());

    while i < a.len() || j < b.len() {
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let ac = char_order(a.get(i).copied());
            let bc = char_order(b.get(j).copied());

            if ac != bc {
                return ac.cmp(&bc);
            }

            i += 1;
            j += 1;
        }

        while a.get(i) == Some(&b'0') {
            i += 1;
        }
        while b.get(j) == Some(&b'0') {
            j += 1;
        }

        // Digit runs of equal length are decided by their first differing digit.
        let mut first_diff = Ordering::Equal;

        while is_digit(a, i) && is_digit(b, j) {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }

            i += 1;
            j += 1;
        }

        if is_digit(a, i) {
            return Ordering::Greater;
        }
        if is_digit(b, j) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }

    Ordering::Equal
}

impl PartialOrd<Self> for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // The absence of a debian revision is equivalent to `0`.
        self.epoch_assumed()
            .cmp(&other.epoch_assumed())
            .then_with(|| compare_component(&self.upstream_version, &other.upstream_version))
            .then_with(|| {
                compare_component(
                    self.debian_revision.as_deref().unwrap_or("0"),
                    other.debian_revision.as_deref().unwrap_or("0"),
                )
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn parse() -> Result<()> {
        assert_eq!(
            PackageVersion::parse("1:4.7.0+dfsg1-2")?,
            PackageVersion {
                epoch: Some(1),
                upstream_version: "4.7.0+dfsg1".into(),
                debian_revision: Some("2".into()),
            }
        );
        assert_eq!(
            PackageVersion::parse("0.18.0+dfsg-2+b1")?,
            PackageVersion {
                epoch: None,
                upstream_version: "0.18.0+dfsg".into(),
                debian_revision: Some("2+b1".into())
            }
        );
        assert_eq!(
            PackageVersion::parse("2:1.0-rc1-3")?.upstream_version(),
            "1.0-rc1"
        );

        Ok(())
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(PackageVersion::parse(""), Err(VersionError::Empty)));
        assert!(matches!(
            PackageVersion::parse("a:1.0"),
            Err(VersionError::EpochNonNumeric(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.0_beta"),
            Err(VersionError::UpstreamVersionIllegalChar(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.0-"),
            Err(VersionError::DebianRevisionIllegalChar(_))
        ));
    }

    #[test]
    fn format() -> Result<()> {
        for s in ["1:4.7.0+dfsg1-2", "3.3.2.final~github", "0.18.0+dfsg-2+b1"] {
            assert_eq!(PackageVersion::parse(s)?.to_string(), s);
        }

        Ok(())
    }

    #[test]
    fn tilde_sorts_first() {
        assert!(v("1.0~beta1~svn1245") < v("1.0~beta1"));
        assert!(v("1.0~beta1") < v("1.0"));
        assert!(v("1.0~") < v("1.0"));
        assert!(v("1.0~~") < v("1.0~"));
    }

    #[test]
    fn letters_before_non_letters() {
        assert!(v("1.0a") < v("1.0b"));
        assert!(v("1.0a") < v("1.0+"));
        assert!(v("1.0") < v("1.0a"));
        assert!(v("1.0+dfsg") < v("1.0.1"));
    }

    #[test]
    fn numeric_runs() {
        assert!(v("1.9") < v("1.10"));
        assert!(v("1.8") < v("1.9"));
        assert!(v("1.9") < v("2.0"));
        assert_eq!(v("1.001").cmp(&v("1.1")), Ordering::Equal);
        assert!(v("1.0-2") < v("1.0-10"));
    }

    #[test]
    fn epoch_and_revision() {
        assert!(v("1:0.1") > v("9.9"));
        assert_eq!(v("0:1.0").cmp(&v("1.0")), Ordering::Equal);
        assert_eq!(v("1.0").cmp(&v("1.0-0")), Ordering::Equal);
        assert!(v("1.0-1") > v("1.0"));
        assert!(v("1.0-1ubuntu1") > v("1.0-1"));
        assert!(v("1.0-1build1") < v("1.0-1ubuntu1"));
    }

    #[test]
    fn serde_as_string() -> std::result::Result<(), serde_yaml::Error> {
        let parsed: PackageVersion = serde_yaml::from_str("'1:2.0-1'")?;
        assert_eq!(parsed, v("1:2.0-1"));
        assert!(serde_yaml::from_str::<PackageVersion>("'a:b'").is_err());

        Ok(())
    }
}
