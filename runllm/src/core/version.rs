//! Runtime version identifiers and compatibility bounds.
//!
//! Ordering: release triple first, then `dev < pre-release < release < post`.
//! Pre-releases order as `alpha < beta < rc`, then by number.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)^
        (\d+)(?:\.(\d+))?(?:\.(\d+))?
        (?:
            [-._]?(alpha|a|beta|b|rc|c)[-._]?(\d*)
          | [-._]?post[-._]?(\d*)
          | [-._]?dev[-._]?(\d*)
        )?
        $",
    )
    .expect("version regex should compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreKind {
    Alpha,
    Beta,
    Rc,
}

/// Variant order encodes the qualifier ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Qualifier {
    Dev(u64),
    Pre(PreKind, u64),
    Release,
    Post(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub release: [u64; 3],
    pub qualifier: Qualifier,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version identifier '{0}'")]
pub struct VersionParseError(pub String);

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let text = raw.trim();
        let caps = VERSION_RE
            .captures(text)
            .ok_or_else(|| VersionParseError(raw.to_string()))?;
        let number = |index: usize| -> Result<u64, VersionParseError> {
            match caps.get(index).map(|m| m.as_str()) {
                None | Some("") => Ok(0),
                Some(digits) => digits
                    .parse()
                    .map_err(|_| VersionParseError(raw.to_string())),
            }
        };

        let release = [number(1)?, number(2)?, number(3)?];
        let qualifier = if let Some(kind) = caps.get(4) {
            let kind = match kind.as_str().to_ascii_lowercase().as_str() {
                "a" | "alpha" => PreKind::Alpha,
                "b" | "beta" => PreKind::Beta,
                _ => PreKind::Rc,
            };
            Qualifier::Pre(kind, number(5)?)
        } else if caps.get(6).is_some() {
            Qualifier::Post(number(6)?)
        } else if caps.get(7).is_some() {
            Qualifier::Dev(number(7)?)
        } else {
            Qualifier::Release
        };
        Ok(Self { release, qualifier })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.release;
        write!(f, "{major}.{minor}.{patch}")?;
        match self.qualifier {
            Qualifier::Dev(n) => write!(f, ".dev{n}"),
            Qualifier::Pre(PreKind::Alpha, n) => write!(f, "a{n}"),
            Qualifier::Pre(PreKind::Beta, n) => write!(f, "b{n}"),
            Qualifier::Pre(PreKind::Rc, n) => write!(f, "rc{n}"),
            Qualifier::Release => Ok(()),
            Qualifier::Post(n) => write!(f, ".post{n}"),
        }
    }
}

/// Half-open runtime range `[min, max_exclusive)` a program accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCompat {
    pub min: Version,
    pub max_exclusive: Option<Version>,
}

impl RuntimeCompat {
    pub fn contains(&self, running: &Version) -> bool {
        if running.cmp(&self.min) == Ordering::Less {
            return false;
        }
        self.max_exclusive
            .as_ref()
            .is_none_or(|max| running < max)
    }
}

impl fmt::Display for RuntimeCompat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.max_exclusive {
            Some(max) => write!(f, "[{}, {max})", self.min),
            None => write!(f, ">= {}", self.min),
        }
    }
}
