// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Publication domination.

Within a suite, only the newest publication of each package name stays published.
*Domination* marks every other publication of that name as superseded by the newest.
*Judgement* then decides which superseded (or deleted) publications may be removed
from disk and schedules their deletion after a stay of execution.

Binaries are dominated per architecture. A superseded source is only scheduled for
deletion once no live binaries built from it remain in the suite, unless the same
source release is still published elsewhere in the suite (e.g. it moved component).
Sources blocked by live binaries are reconsidered on a later run.

A pass over one suite is not crash safe. If interrupted, re-run the whole suite.
*/

use {
    crate::{
        config::DominationConfig,
        error::Result,
        publication::{
            BinaryPublication, Publication, PublicationFilter, PublicationStore,
            PublishingStatus, SourcePublication, Suite,
        },
    },
    chrono::{DateTime, Duration, Utc},
    log::{debug, info},
    std::{
        collections::{BTreeMap, BTreeSet},
        ops::AddAssign,
    },
};

/// Counts of changes made by domination.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DominationReport {
    /// Suites processed.
    pub suites: usize,
    pub superseded_sources: usize,
    pub superseded_binaries: usize,
    /// Sources scheduled for deletion.
    pub judged_sources: usize,
    /// Binaries scheduled for deletion.
    pub judged_binaries: usize,
    /// Superseded sources held back by live binaries.
    pub blocked_sources: usize,
}

impl DominationReport {
    /// Whether any publication record was changed.
    pub fn changed(&self) -> bool {
        self.superseded_sources
            + self.superseded_binaries
            + self.judged_sources
            + self.judged_binaries
            > 0
    }
}

impl AddAssign for DominationReport {
    fn add_assign(&mut self, other: Self) {
        self.suites += other.suites;
        self.superseded_sources += other.superseded_sources;
        self.superseded_binaries += other.superseded_binaries;
        self.judged_sources += other.judged_sources;
        self.judged_binaries += other.judged_binaries;
        self.blocked_sources += other.blocked_sources;
    }
}

/// Group publications by name, newest first within each group.
///
/// Versions are compared with Debian rules. Identical versions are ordered by creation
/// date, earliest first, then by id. Names with a single publication are omitted since
/// there is nothing to dominate.
pub fn sort_publications<P: Publication>(publications: Vec<P>) -> BTreeMap<String, Vec<P>> {
    let mut groups: BTreeMap<String, Vec<P>> = BTreeMap::new();

    for publication in publications {
        groups
            .entry(publication.name().to_string())
            .or_default()
            .push(publication);
    }

    groups.retain(|_, group| group.len() > 1);

    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            b.version()
                .cmp(a.version())
                .then_with(|| a.date_created().cmp(&b.date_created()))
                .then_with(|| a.id().cmp(&b.id()))
        });
    }

    groups
}

/// Supersede all but the first publication of every group.
///
/// Returns the publications that changed.
fn dominate_groups<P: Publication>(groups: BTreeMap<String, Vec<P>>) -> Vec<P> {
    let mut superseded = vec![];

    for (name, group) in groups {
        let mut group = group.into_iter();

        let dominant = match group.next() {
            Some(dominant) => dominant,
            None => continue,
        };

        for mut publication in group {
            debug!(
                "{} {} superseded by {} (publication {})",
                name,
                publication.version(),
                dominant.version(),
                dominant.id()
            );

            publication.state_mut().supersede(dominant.id());
            superseded.push(publication);
        }
    }

    superseded
}

/// Decides which publications are current and which may be removed.
pub struct Dominator<'store, S: PublicationStore + ?Sized> {
    store: &'store mut S,
    archive: String,
    stay_of_execution: Duration,
}

impl<'store, S: PublicationStore + ?Sized> Dominator<'store, S> {
    pub fn new(store: &'store mut S, archive: impl ToString, stay_of_execution: Duration) -> Self {
        Self {
            store,
            archive: archive.to_string(),
            stay_of_execution,
        }
    }

    pub fn from_config(store: &'store mut S, config: &DominationConfig) -> Self {
        Self::new(store, &config.archive, config.stay_of_execution())
    }

    fn filter<'a>(
        &'a self,
        suite: &'a Suite,
        statuses: &'a [PublishingStatus],
    ) -> PublicationFilter<'a> {
        PublicationFilter {
            archive: &self.archive,
            suite,
            statuses,
        }
    }

    /// Supersede all but the newest published binary of each name on each architecture.
    pub fn dominate_binaries(&mut self, suite: &Suite) -> Result<usize> {
        let published = self
            .store
            .binary_publications(&self.filter(suite, &[PublishingStatus::Published]))?;

        let mut by_architecture: BTreeMap<String, Vec<BinaryPublication>> = BTreeMap::new();
        for publication in published {
            by_architecture
                .entry(publication.architecture.clone())
                .or_default()
                .push(publication);
        }

        let mut count = 0;

        for (architecture, publications) in by_architecture {
            let superseded = dominate_groups(sort_publications(publications));

            debug!(
                "{}/{}: {} binaries superseded",
                suite,
                architecture,
                superseded.len()
            );

            for publication in &superseded {
                self.store
                    .update_binary_state(publication.id, &publication.state)?;
            }

            count += superseded.len();
        }

        Ok(count)
    }

    /// Supersede all but the newest published source of each name.
    pub fn dominate_sources(&mut self, suite: &Suite) -> Result<usize> {
        let published = self
            .store
            .source_publications(&self.filter(suite, &[PublishingStatus::Published]))?;

        let superseded = dominate_groups(sort_publications(published));

        for publication in &superseded {
            self.store
                .update_source_state(publication.id, &publication.state)?;
        }

        Ok(superseded.len())
    }

    /// Schedule deletion of every superseded or deleted binary not yet scheduled.
    pub fn judge_binaries(&mut self, suite: &Suite, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self.store.binary_publications(&self.filter(
            suite,
            &[PublishingStatus::Superseded, PublishingStatus::Deleted],
        ))?;

        let mut count = 0;

        for mut publication in candidates {
            if !publication.state.awaits_judgement() {
                continue;
            }

            publication
                .state
                .schedule_deletion(now, self.stay_of_execution);
            debug!(
                "binary {} {} ({}) scheduled for deletion at {:?}",
                publication.binary_name,
                publication.version,
                publication.architecture,
                publication.state.scheduled_deletion_date
            );

            self.store
                .update_binary_state(publication.id, &publication.state)?;
            count += 1;
        }

        Ok(count)
    }

    /// Schedule deletion of superseded or deleted sources no live binary depends on.
    ///
    /// Returns the number of sources scheduled and the number held back.
    pub fn judge_sources(&mut self, suite: &Suite, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let candidates = self.store.source_publications(&self.filter(
            suite,
            &[PublishingStatus::Superseded, PublishingStatus::Deleted],
        ))?;

        if !candidates.iter().any(|p| p.state.awaits_judgement()) {
            return Ok((0, 0));
        }

        let live_built_from = self
            .store
            .binary_publications(&self.filter(
                suite,
                &[PublishingStatus::Published, PublishingStatus::Superseded],
            ))?
            .into_iter()
            .filter(|p| p.state.is_live())
            .map(|p| p.built_from)
            .collect::<BTreeSet<_>>();

        let published_sources = self
            .store
            .source_publications(&self.filter(suite, &[PublishingStatus::Published]))?;

        let (mut judged, mut blocked) = (0, 0);

        for mut publication in candidates {
            if !publication.state.awaits_judgement() {
                continue;
            }

            if live_built_from.contains(&publication.source_release)
                && !Self::published_elsewhere(&publication, &published_sources)
            {
                debug!(
                    "source {} {} still has live binaries; keeping it",
                    publication.source_name, publication.version
                );
                blocked += 1;
                continue;
            }

            publication
                .state
                .schedule_deletion(now, self.stay_of_execution);
            debug!(
                "source {} {} scheduled for deletion at {:?}",
                publication.source_name,
                publication.version,
                publication.state.scheduled_deletion_date
            );

            self.store
                .update_source_state(publication.id, &publication.state)?;
            judged += 1;
        }

        Ok((judged, blocked))
    }

    /// Whether another publication of the same source release is published.
    fn published_elsewhere(publication: &SourcePublication, published: &[SourcePublication]) -> bool {
        published
            .iter()
            .any(|p| p.id != publication.id && p.source_release == publication.source_release)
    }

    /// Run domination and judgement over one suite.
    ///
    /// Binaries are judged before sources so sources whose binaries become removable in
    /// this pass are removable in this pass too.
    pub fn judge_and_dominate(&mut self, suite: &Suite, now: DateTime<Utc>) -> Result<DominationReport> {
        info!("dominating {} in {}", suite, self.archive);

        let superseded_binaries = self.dominate_binaries(suite)?;
        let superseded_sources = self.dominate_sources(suite)?;
        self.store.flush()?;

        let judged_binaries = self.judge_binaries(suite, now)?;
        let (judged_sources, blocked_sources) = self.judge_sources(suite, now)?;
        self.store.flush()?;

        let report = DominationReport {
            suites: 1,
            superseded_sources,
            superseded_binaries,
            judged_sources,
            judged_binaries,
            blocked_sources,
        };

        info!(
            "{}: superseded {} sources and {} binaries; scheduled deletion of {} sources and {} binaries; {} sources held by live binaries",
            suite,
            report.superseded_sources,
            report.superseded_binaries,
            report.judged_sources,
            report.judged_binaries,
            report.blocked_sources
        );

        Ok(report)
    }

    /// Run [Self::judge_and_dominate()] over several suites in order.
    ///
    /// `should_continue` is consulted before each suite. Returning `false` stops the run
    /// without starting further suites.
    pub fn judge_and_dominate_suites<'a>(
        &mut self,
        suites: impl IntoIterator<Item = &'a Suite>,
        now: DateTime<Utc>,
        mut should_continue: impl FnMut() -> bool,
    ) -> Result<DominationReport> {
        let mut report = DominationReport::default();

        for suite in suites {
            if !should_continue() {
                info!("stopping domination before {}", suite);
                break;
            }

            report += self.judge_and_dominate(suite, now)?;
        }

        Ok(report)
    }
}
