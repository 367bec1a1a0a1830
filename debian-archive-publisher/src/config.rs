// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publisher configuration.

Configuration is expressed as YAML:

```yaml
pool:
  root: /srv/archive/ubuntu/pool
  temp_dir: /srv/archive/ubuntu-temp
  checksum: sha1
  preferred_components: [main, restricted, universe, multiverse]
  lock_file: /srv/archive/publisher.lock
domination:
  archive: primary
  stay_of_execution_hours: 24
  suites:
    - distroseries: focal
      pocket: updates
```
*/

use {
    crate::{
        error::{PublisherError, Result},
        io::ChecksumType,
        pool::PoolLayout,
        publication::Suite,
    },
    chrono::Duration,
    serde::{Deserialize, Serialize},
    std::path::{Path, PathBuf},
};

fn default_archive() -> String {
    "primary".to_string()
}

fn default_stay_of_execution_hours() -> u32 {
    24
}

/// Configuration of the on-disk pool.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Root directory of the pool.
    pub root: PathBuf,

    /// Directory for files being written. Must share a filesystem with `root`.
    pub temp_dir: PathBuf,

    #[serde(default)]
    pub layout: PoolLayout,

    /// Checksum flavor the content store reports.
    #[serde(default)]
    pub checksum: ChecksumType,

    /// Components in order of preference for holding real files.
    #[serde(default)]
    pub preferred_components: Vec<String>,

    /// File held while a run mutates the pool.
    #[serde(default)]
    pub lock_file: Option<PathBuf>,
}

/// Configuration of publication domination.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DominationConfig {
    #[serde(default = "default_archive")]
    pub archive: String,

    /// Delay between a publication becoming removable and its scheduled deletion.
    #[serde(default = "default_stay_of_execution_hours")]
    pub stay_of_execution_hours: u32,

    /// Suites to dominate, in order.
    #[serde(default)]
    pub suites: Vec<Suite>,
}

impl Default for DominationConfig {
    fn default() -> Self {
        Self {
            archive: default_archive(),
            stay_of_execution_hours: default_stay_of_execution_hours(),
            suites: vec![],
        }
    }
}

impl DominationConfig {
    pub fn stay_of_execution(&self) -> Duration {
        Duration::hours(self.stay_of_execution_hours as i64)
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    pub pool: PoolConfig,

    #[serde(default)]
    pub domination: DominationConfig,
}

impl PublisherConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fh = std::fs::File::open(path)
            .map_err(|e| PublisherError::PoolIoPath(format!("{}", path.display()), e))?;

        Ok(serde_yaml::from_reader(fh)?)
    }
}
