// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! The archive *pool*.

The pool is the area of a Debian archive holding every published file exactly once.
Files live at `<component>/<name_prefix>/<source>/<filename>` relative to the pool
root. When the same file is published in several components, one component (the
*default* component) holds the real file and the others hold relative symlinks to it.

[Poolifier] maps between source packages and pool directories.
[atomic::AtomicFile] writes files so they only appear once complete.
[disk::DiskPool] keeps an in-memory model of the pool consistent with the filesystem.
*/

use {
    crate::error::{PublisherError, Result},
    serde::{Deserialize, Serialize},
    std::str::FromStr,
};

pub mod atomic;
pub mod disk;

pub use disk::{DiskPool, PoolAddCheck, PoolAddOutcome, PoolEntry, PoolFileWriter, PoolStats};

/// Describes the directory layout of the pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum PoolLayout {
    /// File paths are `<component>/<name_prefix>/<source>/<filename>`.
    ///
    /// This is the layout as used by the Debian distribution.
    ///
    /// For source packages beginning with `lib`, the prefix is the first 4 characters
    /// (e.g. `libz`). For everything else, it is the first character. For example, file
    /// `zstd_1.4.8+dfsg-2.1_amd64.deb` of source `libzstd` in component `main` lives at
    /// `main/libz/libzstd/zstd_1.4.8+dfsg-2.1_amd64.deb`.
    ComponentThenNamePrefix,
}

impl Default for PoolLayout {
    fn default() -> Self {
        Self::ComponentThenNamePrefix
    }
}

impl PoolLayout {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ComponentThenNamePrefix => "component-then-name-prefix",
        }
    }

    /// The directory holding files of a source package, relative to the pool root.
    pub fn source_dir(&self, component: &str, source: &str) -> Result<String> {
        if source.is_empty() {
            return Err(PublisherError::EmptySourceName);
        }

        match self {
            Self::ComponentThenNamePrefix => {
                let prefix_len = if source.starts_with("lib") { 4 } else { 1 };

                // Char boundaries rather than byte offsets so odd names can't panic.
                let prefix_end = source
                    .char_indices()
                    .nth(prefix_len)
                    .map(|(pos, _)| pos)
                    .unwrap_or(source.len());

                Ok(format!(
                    "{}/{}/{}",
                    component,
                    &source[0..prefix_end],
                    source
                ))
            }
        }
    }

    /// Decode a pool relative path into `(component, source, filename)`.
    pub fn decode(&self, path: &str) -> Result<(String, String, Option<String>)> {
        match self {
            Self::ComponentThenNamePrefix => {
                let parts = path.trim_matches('/').split('/').collect::<Vec<_>>();

                match parts.as_slice() {
                    [component, _, source] => {
                        Ok((component.to_string(), source.to_string(), None))
                    }
                    [component, _, source, filename] => Ok((
                        component.to_string(),
                        source.to_string(),
                        Some(filename.to_string()),
                    )),
                    _ => Err(PublisherError::MalformedPoolPath(path.to_string())),
                }
            }
        }
    }
}

impl FromStr for PoolLayout {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "component-then-name-prefix" | "debian" => Ok(Self::ComponentThenNamePrefix),
            _ => Err(PublisherError::UnknownPoolLayout(s.to_string())),
        }
    }
}

impl TryFrom<String> for PoolLayout {
    type Error = PublisherError;

    fn try_from(s: String) -> Result<Self> {
        Self::from_str(&s)
    }
}

impl From<PoolLayout> for String {
    fn from(layout: PoolLayout) -> Self {
        layout.name().to_string()
    }
}

/// Maps source packages to pool directories and back.
#[derive(Clone, Debug, Default)]
pub struct Poolifier {
    layout: PoolLayout,
    component: Option<String>,
}

impl Poolifier {
    pub fn new(layout: PoolLayout) -> Self {
        Self {
            layout,
            component: None,
        }
    }

    /// Configure the component used when [Self::poolify()] is not given one.
    pub fn set_default_component(&mut self, component: impl ToString) {
        self.component = Some(component.to_string());
    }

    pub fn layout(&self) -> PoolLayout {
        self.layout
    }

    /// Compute the pool relative directory of a source package.
    ///
    /// `component` falls back to the configured default. An empty or missing component
    /// is an error.
    pub fn poolify(&self, source: &str, component: Option<&str>) -> Result<String> {
        let component = component
            .or(self.component.as_deref())
            .filter(|c| !c.is_empty())
            .ok_or(PublisherError::UnconfiguredComponent)?;

        self.layout.source_dir(component, source)
    }

    /// Split a pool relative path into `(component, source, filename)`.
    ///
    /// The path must have exactly 3 (directory) or 4 (file) segments.
    pub fn unpoolify(&self, path: &str) -> Result<(String, String, Option<String>)> {
        self.layout.decode(path)
    }
}
