// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publication records.

A publication asserts that a specific package version is (or was) available in a
suite of an archive. Records live in a persistent store which is abstracted by
[PublicationStore]. Domination only ever changes the fields held in
[PublicationState]; records are never created or deleted here.
*/

use {
    crate::{
        error::{PublisherError, Result},
        package_version::PackageVersion,
    },
    chrono::{DateTime, Duration, Utc},
    serde::{Deserialize, Serialize},
    std::{
        fmt::{Display, Formatter},
        path::Path,
        str::FromStr,
    },
};

/// Identifier of a publication record.
pub type PublicationId = u64;

/// Lifecycle status of a publication.
///
/// Transitions only move forward: `PENDING` → `PUBLISHED` → `SUPERSEDED` → `DELETED`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PublishingStatus {
    Pending,
    Published,
    Superseded,
    Deleted,
    Obsolete,
}

/// An archive pocket.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pocket {
    Release,
    Security,
    Updates,
    Proposed,
    Backports,
}

impl Pocket {
    /// Suffix appended to a series name to form the suite name.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Release => "",
            Self::Security => "-security",
            Self::Updates => "-updates",
            Self::Proposed => "-proposed",
            Self::Backports => "-backports",
        }
    }
}

impl FromStr for Pocket {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "release" => Ok(Self::Release),
            "security" => Ok(Self::Security),
            "updates" => Ok(Self::Updates),
            "proposed" => Ok(Self::Proposed),
            "backports" => Ok(Self::Backports),
            _ => Err(PublisherError::UnknownPocket(s.to_string())),
        }
    }
}

/// A distribution series plus pocket. The unit of domination.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Suite {
    pub distroseries: String,
    pub pocket: Pocket,
}

impl Suite {
    pub fn new(distroseries: impl ToString, pocket: Pocket) -> Self {
        Self {
            distroseries: distroseries.to_string(),
            pocket,
        }
    }
}

impl Display for Suite {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.distroseries, self.pocket.suffix())
    }
}

impl FromStr for Suite {
    type Err = PublisherError;

    /// Parse names like `focal` or `focal-updates`.
    fn from_str(s: &str) -> Result<Self> {
        let (series, pocket) = match s.rsplit_once('-') {
            Some((series, pocket)) => match Pocket::from_str(pocket) {
                Ok(pocket) if pocket != Pocket::Release => (series, pocket),
                _ => (s, Pocket::Release),
            },
            None => (s, Pocket::Release),
        };

        if series.is_empty() {
            return Err(PublisherError::MalformedSuite(s.to_string()));
        }

        Ok(Self::new(series, pocket))
    }
}

/// The mutable part of a publication record.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct PublicationState {
    pub status: PublishingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<PublicationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_deletion_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_made_pending: Option<DateTime<Utc>>,
}

impl PublicationState {
    pub fn new(status: PublishingStatus) -> Self {
        Self {
            status,
            superseded_by: None,
            scheduled_deletion_date: None,
            date_made_pending: None,
        }
    }

    /// Mark superseded by another publication.
    pub fn supersede(&mut self, dominant: PublicationId) {
        self.status = PublishingStatus::Superseded;
        self.superseded_by = Some(dominant);
    }

    /// Whether this publication still counts as live for removal purposes.
    pub fn is_live(&self) -> bool {
        match self.status {
            PublishingStatus::Published => true,
            PublishingStatus::Superseded => self.scheduled_deletion_date.is_none(),
            _ => false,
        }
    }

    /// Whether this publication awaits a removal decision.
    pub fn awaits_judgement(&self) -> bool {
        matches!(
            self.status,
            PublishingStatus::Superseded | PublishingStatus::Deleted
        ) && self.scheduled_deletion_date.is_none()
    }

    /// Schedule removal. Deleted publications are due immediately.
    pub fn schedule_deletion(&mut self, now: DateTime<Utc>, stay_of_execution: Duration) {
        self.scheduled_deletion_date = Some(if self.status == PublishingStatus::Deleted {
            now
        } else {
            now + stay_of_execution
        });
        self.date_made_pending = Some(now);
    }
}

/// Common view over source and binary publications.
pub trait Publication {
    fn id(&self) -> PublicationId;

    /// The package name publications are grouped by.
    fn name(&self) -> &str;

    fn version(&self) -> &PackageVersion;

    fn date_created(&self) -> DateTime<Utc>;

    fn state(&self) -> &PublicationState;

    fn state_mut(&mut self) -> &mut PublicationState;
}

/// Publication of a source package.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct SourcePublication {
    pub id: PublicationId,
    pub archive: String,
    pub distroseries: String,
    pub pocket: Pocket,
    pub component: String,
    pub source_name: String,
    pub version: PackageVersion,
    /// Identity of the uploaded source release. Publications of the same release in
    /// different components share it.
    pub source_release: u64,
    pub date_created: DateTime<Utc>,
    #[serde(flatten)]
    pub state: PublicationState,
}

impl Publication for SourcePublication {
    fn id(&self) -> PublicationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.source_name
    }

    fn version(&self) -> &PackageVersion {
        &self.version
    }

    fn date_created(&self) -> DateTime<Utc> {
        self.date_created
    }

    fn state(&self) -> &PublicationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PublicationState {
        &mut self.state
    }
}

/// Publication of a binary package on one architecture.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct BinaryPublication {
    pub id: PublicationId,
    pub archive: String,
    pub distroseries: String,
    pub pocket: Pocket,
    pub component: String,
    pub binary_name: String,
    pub architecture: String,
    pub version: PackageVersion,
    /// The source release this binary was built from.
    pub built_from: u64,
    pub date_created: DateTime<Utc>,
    #[serde(flatten)]
    pub state: PublicationState,
}

impl Publication for BinaryPublication {
    fn id(&self) -> PublicationId {
        self.id
    }

    fn name(&self) -> &str {
        &self.binary_name
    }

    fn version(&self) -> &PackageVersion {
        &self.version
    }

    fn date_created(&self) -> DateTime<Utc> {
        self.date_created
    }

    fn state(&self) -> &PublicationState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut PublicationState {
        &mut self.state
    }
}

/// Selects publications of one suite in one archive.
#[derive(Clone, Copy, Debug)]
pub struct PublicationFilter<'a> {
    pub archive: &'a str,
    pub suite: &'a Suite,
    /// Only records with one of these statuses match.
    pub statuses: &'a [PublishingStatus],
}

impl<'a> PublicationFilter<'a> {
    fn matches(&self, archive: &str, distroseries: &str, pocket: Pocket, status: PublishingStatus) -> bool {
        archive == self.archive
            && distroseries == self.suite.distroseries
            && pocket == self.suite.pocket
            && self.statuses.contains(&status)
    }

    pub fn matches_source(&self, p: &SourcePublication) -> bool {
        self.matches(&p.archive, &p.distroseries, p.pocket, p.state.status)
    }

    pub fn matches_binary(&self, p: &BinaryPublication) -> bool {
        self.matches(&p.archive, &p.distroseries, p.pocket, p.state.status)
    }
}

/// Persistent storage of publication records.
pub trait PublicationStore {
    fn source_publications(&self, filter: &PublicationFilter) -> Result<Vec<SourcePublication>>;

    fn binary_publications(&self, filter: &PublicationFilter) -> Result<Vec<BinaryPublication>>;

    /// Write back the mutable state of a source publication.
    fn update_source_state(&mut self, id: PublicationId, state: &PublicationState) -> Result<()>;

    /// Write back the mutable state of a binary publication.
    fn update_binary_state(&mut self, id: PublicationId, state: &PublicationState) -> Result<()>;

    /// Make prior updates visible to subsequent queries.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [PublicationStore] held in memory and (de)serializable as YAML.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryPublicationStore {
    #[serde(default)]
    sources: Vec<SourcePublication>,
    #[serde(default)]
    binaries: Vec<BinaryPublication>,
}

impl MemoryPublicationStore {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_yaml_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fh = std::fs::File::open(path)
            .map_err(|e| PublisherError::PoolIoPath(format!("{}", path.display()), e))?;

        Ok(serde_yaml::from_reader(fh)?)
    }

    pub fn to_yaml_writer(&self, writer: impl std::io::Write) -> Result<()> {
        Ok(serde_yaml::to_writer(writer, self)?)
    }

    pub fn add_source(&mut self, publication: SourcePublication) {
        self.sources.push(publication);
    }

    pub fn add_binary(&mut self, publication: BinaryPublication) {
        self.binaries.push(publication);
    }

    pub fn source(&self, id: PublicationId) -> Option<&SourcePublication> {
        self.sources.iter().find(|p| p.id == id)
    }

    pub fn binary(&self, id: PublicationId) -> Option<&BinaryPublication> {
        self.binaries.iter().find(|p| p.id == id)
    }

    pub fn sources(&self) -> &[SourcePublication] {
        &self.sources
    }

    pub fn binaries(&self) -> &[BinaryPublication] {
        &self.binaries
    }
}

impl PublicationStore for MemoryPublicationStore {
    fn source_publications(&self, filter: &PublicationFilter) -> Result<Vec<SourcePublication>> {
        Ok(self
            .sources
            .iter()
            .filter(|p| filter.matches_source(p))
            .cloned()
            .collect())
    }

    fn binary_publications(&self, filter: &PublicationFilter) -> Result<Vec<BinaryPublication>> {
        Ok(self
            .binaries
            .iter()
            .filter(|p| filter.matches_binary(p))
            .cloned()
            .collect())
    }

    fn update_source_state(&mut self, id: PublicationId, state: &PublicationState) -> Result<()> {
        let publication = self
            .sources
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| PublisherError::PublicationStore(format!("no source publication {}", id)))?;

        publication.state = state.clone();

        Ok(())
    }

    fn update_binary_state(&mut self, id: PublicationId, state: &PublicationState) -> Result<()> {
        let publication = self
            .binaries
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| PublisherError::PublicationStore(format!("no binary publication {}", id)))?;

        publication.state = state.clone();

        Ok(())
    }
}
