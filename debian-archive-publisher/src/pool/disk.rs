// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Filesystem backed pool.

[DiskPool] owns an in-memory model of the pool, rebuilt from disk by [DiskPool::scan()]
and mutated together with the filesystem afterwards.

Every filename in the pool has exactly one *default* component holding the real file.
Every other component publishing that filename holds a relative symlink to it.

Only one [DiskPool] may operate on a given pool root at a time. Nothing here enforces
that; callers should hold a [crate::lock::RunLock] for the duration of a run. If the
model is ever suspected to have diverged from disk, discard it and [DiskPool::scan()]
again.
*/

use {
    crate::{
        config::PoolConfig,
        error::{PublisherError, Result},
        io::{ChecksumType, ContentDigest, DigestingWriter},
        pool::{atomic::AtomicFile, PoolLayout, Poolifier},
    },
    log::{debug, error, info, warn},
    std::{
        collections::{BTreeMap, BTreeSet},
        io::{Read, Write},
        path::{Path, PathBuf},
    },
};

/// A filename known to the pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PoolEntry {
    filename: String,
    source: String,
    default_component: String,
    symlink_components: BTreeSet<String>,
    file_hash: Option<ContentDigest>,
}

impl PoolEntry {
    fn new(filename: &str, source: &str, default_component: &str) -> Self {
        Self {
            filename: filename.to_string(),
            source: source.to_string(),
            default_component: default_component.to_string(),
            symlink_components: BTreeSet::new(),
            file_hash: None,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Name of the source package the file belongs to.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// The component holding the real file.
    pub fn default_component(&self) -> &str {
        &self.default_component
    }

    /// Components holding a symlink to the real file.
    pub fn symlink_components(&self) -> &BTreeSet<String> {
        &self.symlink_components
    }

    /// All components publishing this filename, default first.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.default_component.as_str())
            .chain(self.symlink_components.iter().map(|c| c.as_str()))
    }

    pub fn in_component(&self, component: &str) -> bool {
        self.default_component == component || self.symlink_components.contains(component)
    }

    /// The cached content digest of the real file, if computed.
    pub fn file_hash(&self) -> Option<&ContentDigest> {
        self.file_hash.as_ref()
    }
}

/// Result of [DiskPool::check_before_add()].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolAddCheck {
    /// The filename is unknown. Write it via [DiskPool::open_for_add()].
    New,
    /// The component already publishes identical content. Nothing to do.
    AlreadyPresent,
    /// Identical content exists in another component. Use [DiskPool::make_symlink()].
    NeedsSymlink,
}

/// What [DiskPool::add_file()] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolAddOutcome {
    /// A new file with this many bytes was written.
    Added(u64),
    /// A symlink to an existing copy was created.
    Symlinked,
    /// The file was already present.
    AlreadyPresent,
}

/// Counts describing pool content.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Distinct filenames.
    pub entries: usize,
    /// Components publishing at least one file.
    pub components: usize,
    /// Real files, counted per component.
    pub files: usize,
    /// Symlinks, counted per component.
    pub symlinks: usize,
}

/// Compute a relative symlink target from one pool relative file path to another.
fn relative_link(from_file: &str, to_file: &str) -> PathBuf {
    let from_dir = from_file.split('/').collect::<Vec<_>>();
    let from_dir = &from_dir[0..from_dir.len().saturating_sub(1)];
    let to = to_file.split('/').collect::<Vec<_>>();

    let common = from_dir
        .iter()
        .zip(to[0..to.len().saturating_sub(1)].iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut link = PathBuf::new();
    for _ in common..from_dir.len() {
        link.push("..");
    }
    for part in &to[common..] {
        link.push(part);
    }

    link
}

fn remove_path(path: &Path) -> Result<u64> {
    let size = std::fs::symlink_metadata(path)
        .map_err(|e| PublisherError::PoolIoPath(format!("{}", path.display()), e))?
        .len();

    std::fs::remove_file(path)
        .map_err(|e| PublisherError::PoolIoPath(format!("{}", path.display()), e))?;

    Ok(size)
}

fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .map_err(|e| PublisherError::PoolIoPath(format!("{}", link.display()), e))
}

fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| PublisherError::PoolIoPath(format!("{}", parent.display()), e))?;
    }

    Ok(())
}

/// A pool rooted at a filesystem directory.
#[derive(Debug)]
pub struct DiskPool {
    root: PathBuf,
    temp_dir: PathBuf,
    poolifier: Poolifier,
    entries: BTreeMap<String, PoolEntry>,
    /// component -> filename -> is symlink.
    files_in_components: BTreeMap<String, BTreeMap<String, bool>>,
}

impl DiskPool {
    /// Construct an empty pool model bound to a root directory.
    ///
    /// `temp_dir` holds files being written and must be on the same filesystem as `root`
    /// but not inside it. Call [Self::scan()] to load existing content.
    pub fn new(
        root: impl AsRef<Path>,
        temp_dir: impl AsRef<Path>,
        layout: PoolLayout,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let temp_dir = temp_dir.as_ref().to_path_buf();

        if temp_dir.starts_with(&root) {
            return Err(PublisherError::PoolTempDirInsideRoot(format!(
                "{}",
                temp_dir.display()
            )));
        }

        Ok(Self {
            root,
            temp_dir,
            poolifier: Poolifier::new(layout),
            entries: BTreeMap::new(),
            files_in_components: BTreeMap::new(),
        })
    }

    /// Construct an instance from configuration and scan it.
    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        let mut pool = Self::new(&config.root, &config.temp_dir, config.layout)?;
        pool.scan()?;

        Ok(pool)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn poolifier(&self) -> &Poolifier {
        &self.poolifier
    }

    /// The pool relative path of a source directory or of a file within it.
    pub fn relative_path_for(
        &self,
        component: &str,
        source: &str,
        filename: Option<&str>,
    ) -> Result<String> {
        let dir = self.poolifier.poolify(source, Some(component))?;

        Ok(match filename {
            Some(filename) => format!("{}/{}", dir, filename),
            None => dir,
        })
    }

    /// The filesystem path of a source directory or of a file within it.
    ///
    /// No I/O is performed.
    pub fn path_for(&self, component: &str, source: &str, filename: Option<&str>) -> Result<PathBuf> {
        Ok(self
            .root
            .join(self.relative_path_for(component, source, filename)?))
    }

    /// Rebuild the in-memory model from the filesystem.
    ///
    /// Any prior model is discarded.
    pub fn scan(&mut self) -> Result<()> {
        self.entries.clear();
        self.files_in_components.clear();

        if !self.root.exists() {
            debug!("pool root {} does not exist; pool is empty", self.root.display());
            return Ok(());
        }

        // filename -> [(component, source, is_symlink)] in walk order.
        let mut seen: BTreeMap<String, Vec<(String, String, bool)>> = BTreeMap::new();

        let walk = walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by(|a, b| a.file_name().cmp(b.file_name()));

        for entry in walk {
            let entry = entry?;

            if entry.file_type().is_dir() {
                continue;
            }

            let rel_path = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| {
                    PublisherError::MalformedPoolPath(format!("{}", entry.path().display()))
                })?
                .to_str()
                .ok_or_else(|| {
                    PublisherError::MalformedPoolPath(format!("{}", entry.path().display()))
                })?
                .to_string();

            let (component, source, filename) = match self.poolifier.unpoolify(&rel_path)? {
                (component, source, Some(filename)) => (component, source, filename),
                _ => return Err(PublisherError::MalformedPoolPath(rel_path)),
            };

            seen.entry(filename).or_default().push((
                component,
                source,
                entry.path_is_symlink(),
            ));
        }

        for (filename, locations) in seen {
            let (default_component, source) = match locations.iter().find(|(_, _, link)| !link) {
                Some((component, source, _)) => (component.clone(), source.clone()),
                None => {
                    warn!(
                        "{} only exists as symlinks in the pool; ignoring it",
                        filename
                    );
                    continue;
                }
            };

            let mut pool_entry = PoolEntry::new(&filename, &source, &default_component);

            for (component, _, is_symlink) in locations {
                if component == default_component {
                    continue;
                }

                if !is_symlink {
                    warn!(
                        "{} is a regular file in both {} and {}; treating the latter as secondary",
                        filename, default_component, component
                    );
                }

                pool_entry.symlink_components.insert(component);
            }

            for component in pool_entry.components() {
                self.files_in_components
                    .entry(component.to_string())
                    .or_default()
                    .insert(filename.clone(), component != default_component);
            }

            self.entries.insert(filename, pool_entry);
        }

        let stats = self.stats();
        info!(
            "scanned pool {}: {} entries in {} components, {} files, {} symlinks",
            self.root.display(),
            stats.entries,
            stats.components,
            stats.files,
            stats.symlinks
        );

        Ok(())
    }

    /// Obtain the entry for a filename.
    pub fn entry(&self, filename: &str) -> Option<&PoolEntry> {
        self.entries.get(filename)
    }

    /// Iterate over all entries, ordered by filename.
    pub fn entries(&self) -> impl Iterator<Item = &PoolEntry> {
        self.entries.values()
    }

    /// Filenames published in a component, mapped to whether they are symlinks.
    pub fn component_files(&self, component: &str) -> Option<&BTreeMap<String, bool>> {
        self.files_in_components.get(component)
    }

    /// Whether a component's copy of a file is a symlink. `None` if not published there.
    pub fn is_symlink(&self, component: &str, filename: &str) -> Option<bool> {
        self.files_in_components
            .get(component)
            .and_then(|files| files.get(filename))
            .copied()
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            entries: self.entries.len(),
            components: self.files_in_components.len(),
            ..Default::default()
        };

        for is_symlink in self.files_in_components.values().flat_map(|files| files.values()) {
            if *is_symlink {
                stats.symlinks += 1;
            } else {
                stats.files += 1;
            }
        }

        stats
    }

    /// Obtain the content digest of a file, computing it on first request.
    ///
    /// The digest is cached on the pool entry. A request for a different checksum
    /// flavor than the cached one recomputes and replaces it.
    pub fn get_and_cache_file_hash(
        &mut self,
        component: &str,
        source: &str,
        filename: &str,
        checksum: ChecksumType,
    ) -> Result<ContentDigest> {
        let path = self.path_for(component, source, Some(filename))?;

        let entry = self
            .entries
            .get_mut(filename)
            .ok_or_else(|| PublisherError::PoolEntryMissing(filename.to_string()))?;

        if let Some(digest) = &entry.file_hash {
            if digest.checksum_type() == checksum {
                return Ok(digest.clone());
            }
        }

        let digest = checksum.digest_path(&path)?;
        entry.file_hash = Some(digest.clone());

        Ok(digest)
    }

    /// Determine what adding a file with the given content digest requires.
    ///
    /// Returns [PublisherError::PoolFileOverwrite] if the filename exists with different
    /// content, regardless of component.
    pub fn check_before_add(
        &mut self,
        component: &str,
        source: &str,
        filename: &str,
        digest: &ContentDigest,
    ) -> Result<PoolAddCheck> {
        let (default_component, entry_source) = match self.entries.get(filename) {
            Some(entry) => (entry.default_component.clone(), entry.source.clone()),
            None => return Ok(PoolAddCheck::New),
        };

        let existing = self.get_and_cache_file_hash(
            &default_component,
            &entry_source,
            filename,
            digest.checksum_type(),
        )?;

        if &existing != digest {
            error!(
                "{} ({}/{}) already in pool with different content: expected {}, found {}",
                filename, component, source, digest, existing
            );

            return Err(PublisherError::PoolFileOverwrite {
                filename: filename.to_string(),
                component: component.to_string(),
                source_package: source.to_string(),
                expected: digest.to_string(),
                actual: existing.to_string(),
            });
        }

        if self.is_symlink(component, filename).is_some() {
            Ok(PoolAddCheck::AlreadyPresent)
        } else {
            Ok(PoolAddCheck::NeedsSymlink)
        }
    }

    /// Begin writing a file new to the pool.
    ///
    /// [Self::check_before_add()] must have returned [PoolAddCheck::New]. The entry is
    /// registered immediately and unregistered again if the writer is not committed.
    pub fn open_for_add(
        &mut self,
        component: &str,
        source: &str,
        filename: &str,
    ) -> Result<PoolFileWriter<'_>> {
        let path = self.path_for(component, source, Some(filename))?;

        if self.entries.contains_key(filename) {
            return Err(PublisherError::PoolTargetExists(format!(
                "{}",
                path.display()
            )));
        }

        create_parent_dir(&path)?;
        let file = AtomicFile::create(&path, &self.temp_dir)?;

        debug!("opened {} for writing", path.display());

        self.entries.insert(
            filename.to_string(),
            PoolEntry::new(filename, source, component),
        );
        self.files_in_components
            .entry(component.to_string())
            .or_default()
            .insert(filename.to_string(), false);

        Ok(PoolFileWriter {
            pool: self,
            component: component.to_string(),
            filename: filename.to_string(),
            file: Some(file),
        })
    }

    /// Undo the registration performed by [Self::open_for_add()].
    fn unregister_added(&mut self, component: &str, filename: &str) {
        let remove = self
            .entries
            .get(filename)
            .map(|e| e.default_component == component && e.symlink_components.is_empty())
            .unwrap_or(false);

        if remove {
            self.entries.remove(filename);
            self.remove_from_index(component, filename);
        }
    }

    fn remove_from_index(&mut self, component: &str, filename: &str) {
        if let Some(files) = self.files_in_components.get_mut(component) {
            files.remove(filename);

            if files.is_empty() {
                self.files_in_components.remove(component);
            }
        }
    }

    /// Publish an existing pool file in another component via a relative symlink.
    pub fn make_symlink(&mut self, component: &str, source: &str, filename: &str) -> Result<()> {
        let link_rel = self.relative_path_for(component, source, Some(filename))?;
        let link_path = self.root.join(&link_rel);

        if link_path.symlink_metadata().is_ok() {
            return Err(PublisherError::PoolTargetExists(format!(
                "{}",
                link_path.display()
            )));
        }

        let (default_component, entry_source) = match self.entries.get(filename) {
            Some(entry) => (entry.default_component.clone(), entry.source.clone()),
            None => return Err(PublisherError::PoolEntryMissing(filename.to_string())),
        };

        let target_rel =
            self.relative_path_for(&default_component, &entry_source, Some(filename))?;

        create_parent_dir(&link_path)?;
        symlink(&relative_link(&link_rel, &target_rel), &link_path)?;

        info!(
            "symlinked {} in {} to its copy in {}",
            filename, component, default_component
        );

        if let Some(entry) = self.entries.get_mut(filename) {
            entry.symlink_components.insert(component.to_string());
        }
        self.files_in_components
            .entry(component.to_string())
            .or_default()
            .insert(filename.to_string(), true);

        Ok(())
    }

    /// Add a file to the pool, doing whatever [Self::check_before_add()] demands.
    ///
    /// `reader` is only consumed when the filename is new to the pool. Its content must
    /// hash to `digest`, otherwise nothing is added.
    pub fn add_file(
        &mut self,
        component: &str,
        source: &str,
        filename: &str,
        digest: &ContentDigest,
        mut reader: impl Read,
    ) -> Result<PoolAddOutcome> {
        match self.check_before_add(component, source, filename, digest)? {
            PoolAddCheck::AlreadyPresent => {
                debug!("{} already present in {}", filename, component);
                Ok(PoolAddOutcome::AlreadyPresent)
            }
            PoolAddCheck::NeedsSymlink => {
                self.make_symlink(component, source, filename)?;
                Ok(PoolAddOutcome::Symlinked)
            }
            PoolAddCheck::New => {
                let mut writer = DigestingWriter::new(
                    self.open_for_add(component, source, filename)?,
                    digest.checksum_type(),
                );
                std::io::copy(&mut reader, &mut writer)?;
                let (writer, actual) = writer.finish();

                // Dropping the uncommitted writer discards the file and its registration.
                if &actual != digest {
                    drop(writer);
                    error!(
                        "content written for {} ({}/{}) does not match: expected {}, found {}",
                        filename, component, source, digest, actual
                    );

                    return Err(PublisherError::PoolContentMismatch {
                        filename: filename.to_string(),
                        expected: digest.to_string(),
                        actual: actual.to_string(),
                    });
                }

                let size = writer.commit()?;

                if let Some(entry) = self.entries.get_mut(filename) {
                    entry.file_hash = Some(actual);
                }

                Ok(PoolAddOutcome::Added(size))
            }
        }
    }

    /// Remove a component's copy of a file, returning the bytes freed.
    ///
    /// Removing the real file while symlinks to it remain first moves the real file
    /// into another component.
    pub fn remove_file(&mut self, component: &str, source: &str, filename: &str) -> Result<u64> {
        let not_in_pool = || PublisherError::NotInPool(component.to_string(), filename.to_string());

        let (is_default, promote) = match self.entries.get(filename) {
            Some(entry) if entry.source == source && entry.in_component(component) => (
                entry.default_component == component,
                entry.symlink_components.iter().next().cloned(),
            ),
            _ => return Err(not_in_pool()),
        };

        if is_default {
            match promote {
                Some(promote) => {
                    // Lexically smallest component receives the real file.
                    self.shuffle_symlinks(filename, &promote)?;
                }
                None => {
                    let path = self.path_for(component, source, Some(filename))?;
                    let size = remove_path(&path)?;

                    info!("removed {} from {}", filename, component);
                    self.entries.remove(filename);
                    self.remove_from_index(component, filename);

                    return Ok(size);
                }
            }
        }

        let path = self.path_for(component, source, Some(filename))?;
        let size = remove_path(&path)?;

        info!("removed symlink to {} from {}", filename, component);
        if let Some(entry) = self.entries.get_mut(filename) {
            entry.symlink_components.remove(component);
        }
        self.remove_from_index(component, filename);

        Ok(size)
    }

    /// Move the real file into a component currently holding a symlink to it.
    ///
    /// The previous default component becomes a symlink and every other symlink is
    /// recreated to point at the new location.
    fn shuffle_symlinks(&mut self, filename: &str, target_component: &str) -> Result<()> {
        let (old_default, source) = match self.entries.get(filename) {
            Some(entry) if entry.default_component == target_component => return Ok(()),
            Some(entry) if entry.symlink_components.contains(target_component) => {
                (entry.default_component.clone(), entry.source.clone())
            }
            Some(_) => {
                return Err(PublisherError::NotInPool(
                    target_component.to_string(),
                    filename.to_string(),
                ))
            }
            None => return Err(PublisherError::PoolEntryMissing(filename.to_string())),
        };

        let target_rel = self.relative_path_for(target_component, &source, Some(filename))?;
        let target_path = self.root.join(&target_rel);
        let old_path = self.path_for(&old_default, &source, Some(filename))?;

        info!(
            "moving {} from {} to {}",
            filename, old_default, target_component
        );

        remove_path(&target_path)?;
        std::fs::rename(&old_path, &target_path)
            .map_err(|e| PublisherError::PoolIoPath(format!("{}", old_path.display()), e))?;

        let links = match self.entries.get_mut(filename) {
            Some(entry) => {
                entry.symlink_components.remove(target_component);
                entry.symlink_components.insert(old_default.clone());
                entry.default_component = target_component.to_string();
                entry.symlink_components.clone()
            }
            None => return Err(PublisherError::PoolEntryMissing(filename.to_string())),
        };

        if let Some(files) = self.files_in_components.get_mut(target_component) {
            files.insert(filename.to_string(), false);
        }
        self.files_in_components
            .entry(old_default.clone())
            .or_default()
            .insert(filename.to_string(), true);

        for component in links {
            let link_rel = self.relative_path_for(&component, &source, Some(filename))?;
            let link_path = self.root.join(&link_rel);

            match std::fs::remove_file(&link_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(PublisherError::PoolIoPath(
                        format!("{}", link_path.display()),
                        e,
                    ))
                }
            }

            debug!("relinking {} in {} to {}", filename, component, target_component);
            symlink(&relative_link(&link_rel, &target_rel), &link_path)?;
        }

        Ok(())
    }

    /// Ensure real files live in the most preferred component publishing them.
    ///
    /// Partial mirrors often carry only some components. Keeping real files in the most
    /// widely mirrored component avoids dangling symlinks on those mirrors.
    pub fn sanitise_links(&mut self, preferred_components: &[impl AsRef<str>]) -> Result<()> {
        let candidates = self
            .entries
            .values()
            .filter(|e| !e.symlink_components.is_empty())
            .map(|e| (e.filename.clone(), e.default_component.clone(), e.symlink_components.clone()))
            .collect::<Vec<_>>();

        let mut moved = 0;

        for (filename, default_component, symlinks) in candidates {
            for preferred in preferred_components {
                let preferred = preferred.as_ref();

                if preferred == default_component {
                    break;
                }

                if symlinks.contains(preferred) {
                    self.shuffle_symlinks(&filename, preferred)?;
                    moved += 1;
                    break;
                }
            }
        }

        info!("sanitised pool links; moved {} files", moved);

        Ok(())
    }
}

/// Writer for a file being added to a [DiskPool].
///
/// Content becomes visible in the pool only after [Self::commit()]. Dropping the writer
/// without committing discards the content and the pool entry registered for it.
pub struct PoolFileWriter<'pool> {
    pool: &'pool mut DiskPool,
    component: String,
    filename: String,
    file: Option<AtomicFile>,
}

impl<'pool> PoolFileWriter<'pool> {
    /// The path the file will have once committed.
    pub fn target(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.target())
    }

    /// Move the written file into place, returning its size.
    pub fn commit(mut self) -> Result<u64> {
        let file = match self.file.take() {
            Some(file) => file,
            None => return Err(PublisherError::PoolEntryMissing(self.filename.clone())),
        };

        match file.commit() {
            Ok(size) => {
                info!(
                    "added {} ({} bytes) to {}",
                    self.filename, size, self.component
                );
                Ok(size)
            }
            Err(e) => {
                self.pool.unregister_added(&self.component, &self.filename);
                Err(e)
            }
        }
    }
}

impl<'pool> Write for PoolFileWriter<'pool> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "pool file already committed",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'pool> Drop for PoolFileWriter<'pool> {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            warn!(
                "abandoned write of {} to {}; unregistering it",
                self.filename, self.component
            );
            self.pool.unregister_added(&self.component, &self.filename);
        }
    }
}

#[cfg(test)]
mod test {
    use {super::*, tempfile::TempDir};

    struct Fixture {
        _td: TempDir,
        root: PathBuf,
        temp: PathBuf,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let td = TempDir::new()?;
            let root = td.path().join("pool");
            let temp = td.path().join("temp");
            std::fs::create_dir_all(&root)?;
            std::fs::create_dir_all(&temp)?;

            Ok(Self {
                _td: td,
                root,
                temp,
            })
        }

        fn pool(&self) -> Result<DiskPool> {
            let mut pool = DiskPool::new(&self.root, &self.temp, PoolLayout::default())?;
            pool.scan()?;
            Ok(pool)
        }
    }

    fn sha1(data: &[u8]) -> ContentDigest {
        ContentDigest::from_data(ChecksumType::Sha1, data)
    }

    fn add(pool: &mut DiskPool, component: &str, filename: &str, data: &[u8]) -> Result<PoolAddOutcome> {
        pool.add_file(component, "foo", filename, &sha1(data), std::io::Cursor::new(data))
    }

    /// Assert the on-disk layout of a filename matches the model.
    fn assert_consistent(pool: &DiskPool, filename: &str) {
        let entry = pool.entry(filename).expect("entry should exist");
        let real = pool
            .path_for(entry.default_component(), entry.source(), Some(filename))
            .unwrap();

        let meta = std::fs::symlink_metadata(&real).unwrap();
        assert!(meta.file_type().is_file(), "{} should be a file", real.display());
        assert_eq!(pool.is_symlink(entry.default_component(), filename), Some(false));

        for component in entry.symlink_components() {
            let link = pool.path_for(component, entry.source(), Some(filename)).unwrap();
            let meta = std::fs::symlink_metadata(&link).unwrap();
            assert!(meta.file_type().is_symlink(), "{} should be a symlink", link.display());
            assert!(std::fs::read_link(&link).unwrap().is_relative());
            assert_eq!(
                std::fs::canonicalize(&link).unwrap(),
                std::fs::canonicalize(&real).unwrap()
            );
            assert_eq!(pool.is_symlink(component, filename), Some(true));
        }
    }

    #[test]
    fn relative_links() {
        assert_eq!(
            relative_link("universe/f/foo/foo.dsc", "main/f/foo/foo.dsc"),
            PathBuf::from("../../../main/f/foo/foo.dsc")
        );
        assert_eq!(
            relative_link("main/f/foo/a", "main/f/foo/b"),
            PathBuf::from("b")
        );
    }

    #[test]
    fn temp_dir_inside_root_rejected() {
        assert!(matches!(
            DiskPool::new("/srv/pool", "/srv/pool/tmp", PoolLayout::default()),
            Err(PublisherError::PoolTempDirInsideRoot(_))
        ));
    }

    #[test]
    fn path_for_composes() -> Result<()> {
        let pool = DiskPool::new("/srv/pool", "/srv/temp", PoolLayout::default())?;

        assert_eq!(
            pool.path_for("main", "libfoo", Some("libfoo_1.0.dsc"))?,
            PathBuf::from("/srv/pool/main/libf/libfoo/libfoo_1.0.dsc")
        );
        assert_eq!(
            pool.path_for("main", "bar", None)?,
            PathBuf::from("/srv/pool/main/b/bar")
        );

        Ok(())
    }

    #[test]
    fn add_then_already_present() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;

        assert_eq!(add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?, PoolAddOutcome::Added(3));
        assert_eq!(
            std::fs::read(f.root.join("main/f/foo/foo_1.0.dsc"))?,
            b"dsc"
        );
        assert_eq!(
            pool.check_before_add("main", "foo", "foo_1.0.dsc", &sha1(b"dsc"))?,
            PoolAddCheck::AlreadyPresent
        );
        assert_eq!(
            add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?,
            PoolAddOutcome::AlreadyPresent
        );
        assert!(std::fs::read_dir(&f.temp)?.next().is_none());

        Ok(())
    }

    #[test]
    fn different_content_is_overwrite_error() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;

        add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;

        for component in ["main", "universe"] {
            let err = pool
                .check_before_add(component, "foo", "foo_1.0.dsc", &sha1(b"other"))
                .unwrap_err();
            assert!(err.is_corruption());
            assert!(matches!(err, PublisherError::PoolFileOverwrite { .. }));
        }

        assert_eq!(std::fs::read(f.root.join("main/f/foo/foo_1.0.dsc"))?, b"dsc");

        Ok(())
    }

    #[test]
    fn hash_is_cached() -> Result<()> {
        let f = Fixture::new()?;
        std::fs::create_dir_all(f.root.join("main/f/foo"))?;
        std::fs::write(f.root.join("main/f/foo/foo_1.0.dsc"), b"dsc")?;
        let mut pool = f.pool()?;

        let digest = pool.get_and_cache_file_hash("main", "foo", "foo_1.0.dsc", ChecksumType::Sha1)?;
        assert_eq!(digest, sha1(b"dsc"));
        assert_eq!(pool.entry("foo_1.0.dsc").unwrap().file_hash(), Some(&digest));

        // Served from cache even though the file changed underneath.
        std::fs::write(f.root.join("main/f/foo/foo_1.0.dsc"), b"changed")?;
        assert_eq!(
            pool.get_and_cache_file_hash("main", "foo", "foo_1.0.dsc", ChecksumType::Sha1)?,
            digest
        );

        Ok(())
    }

    #[test]
    fn symlink_into_second_component() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;

        add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;
        assert_eq!(
            pool.check_before_add("universe", "foo", "foo_1.0.dsc", &sha1(b"dsc"))?,
            PoolAddCheck::NeedsSymlink
        );
        assert_eq!(
            add(&mut pool, "universe", "foo_1.0.dsc", b"dsc")?,
            PoolAddOutcome::Symlinked
        );

        let link = f.root.join("universe/f/foo/foo_1.0.dsc");
        assert_eq!(
            std::fs::read_link(&link)?,
            PathBuf::from("../../../main/f/foo/foo_1.0.dsc")
        );
        assert_eq!(std::fs::read(&link)?, b"dsc");
        assert_consistent(&pool, "foo_1.0.dsc");

        assert!(matches!(
            pool.make_symlink("universe", "foo", "foo_1.0.dsc"),
            Err(PublisherError::PoolTargetExists(_))
        ));
        assert!(matches!(
            pool.make_symlink("universe", "foo", "foo_2.0.dsc"),
            Err(PublisherError::PoolEntryMissing(_))
        ));

        Ok(())
    }

    #[test]
    fn abandoned_writer_unregisters() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;

        {
            let mut writer = pool.open_for_add("main", "foo", "foo_1.0.dsc")?;
            writer.write_all(b"partial")?;
        }

        assert!(pool.entry("foo_1.0.dsc").is_none());
        assert!(pool.component_files("main").is_none());
        assert!(!f.root.join("main/f/foo/foo_1.0.dsc").exists());
        assert_eq!(
            pool.check_before_add("main", "foo", "foo_1.0.dsc", &sha1(b"dsc"))?,
            PoolAddCheck::New
        );

        Ok(())
    }

    #[test]
    fn open_for_add_registers_optimistically() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;

        let mut writer = pool.open_for_add("main", "foo", "foo_1.0.dsc")?;
        writer.write_all(b"dsc")?;
        assert_eq!(writer.commit()?, 3);

        let entry = pool.entry("foo_1.0.dsc").unwrap();
        assert_eq!(entry.default_component(), "main");
        assert!(entry.symlink_components().is_empty());
        assert_eq!(pool.is_symlink("main", "foo_1.0.dsc"), Some(false));

        assert!(matches!(
            pool.open_for_add("universe", "foo", "foo_1.0.dsc"),
            Err(PublisherError::PoolTargetExists(_))
        ));

        Ok(())
    }

    #[test]
    fn scan_picks_regular_file_as_default() -> Result<()> {
        let f = Fixture::new()?;
        {
            let mut pool = f.pool()?;
            add(&mut pool, "universe", "foo_1.0.dsc", b"dsc")?;
            add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;
            add(&mut pool, "multiverse", "foo_1.0.dsc", b"dsc")?;
            add(&mut pool, "main", "foo_1.0.tar.gz", b"tarball")?;
        }

        let mut pool = f.pool()?;
        let entry = pool.entry("foo_1.0.dsc").unwrap();
        assert_eq!(entry.default_component(), "universe");
        assert_eq!(
            entry.symlink_components().iter().collect::<Vec<_>>(),
            vec!["main", "multiverse"]
        );
        assert_eq!(
            pool.stats(),
            PoolStats {
                entries: 2,
                components: 3,
                files: 2,
                symlinks: 2
            }
        );

        let before = pool.entries().cloned().collect::<Vec<_>>();
        pool.scan()?;
        assert_eq!(pool.entries().cloned().collect::<Vec<_>>(), before);

        Ok(())
    }

    #[test]
    fn scan_rejects_stray_files() -> Result<()> {
        let f = Fixture::new()?;
        std::fs::write(f.root.join("README"), b"hello")?;

        let mut pool = DiskPool::new(&f.root, &f.temp, PoolLayout::default())?;
        assert!(matches!(
            pool.scan(),
            Err(PublisherError::MalformedPoolPath(_))
        ));

        Ok(())
    }

    #[test]
    fn scan_ignores_dangling_symlink_only_entries() -> Result<()> {
        let f = Fixture::new()?;
        std::fs::create_dir_all(f.root.join("universe/f/foo"))?;
        std::os::unix::fs::symlink(
            "../../../main/f/foo/foo_1.0.dsc",
            f.root.join("universe/f/foo/foo_1.0.dsc"),
        )?;

        let pool = f.pool()?;
        assert!(pool.entry("foo_1.0.dsc").is_none());

        Ok(())
    }

    #[test]
    fn remove_symlink() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;
        add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;
        add(&mut pool, "universe", "foo_1.0.dsc", b"dsc")?;

        pool.remove_file("universe", "foo", "foo_1.0.dsc")?;

        assert!(f.root.join("universe/f/foo/foo_1.0.dsc").symlink_metadata().is_err());
        assert!(pool.entry("foo_1.0.dsc").unwrap().symlink_components().is_empty());
        assert_eq!(pool.is_symlink("universe", "foo_1.0.dsc"), None);
        assert_consistent(&pool, "foo_1.0.dsc");

        Ok(())
    }

    #[test]
    fn remove_only_copy() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;
        add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;

        assert_eq!(pool.remove_file("main", "foo", "foo_1.0.dsc")?, 3);
        assert!(!f.root.join("main/f/foo/foo_1.0.dsc").exists());
        assert!(pool.entry("foo_1.0.dsc").is_none());

        assert!(matches!(
            pool.remove_file("main", "foo", "foo_1.0.dsc"),
            Err(PublisherError::NotInPool(_, _))
        ));

        Ok(())
    }

    #[test]
    fn remove_default_with_symlinks_shuffles() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;
        for component in ["main", "universe", "multiverse", "restricted"] {
            add(&mut pool, component, "foo_1.0.dsc", b"dsc")?;
        }

        pool.remove_file("main", "foo", "foo_1.0.dsc")?;

        let entry = pool.entry("foo_1.0.dsc").unwrap();
        assert_eq!(entry.default_component(), "multiverse");
        assert_eq!(
            entry.symlink_components().iter().collect::<Vec<_>>(),
            vec!["restricted", "universe"]
        );
        assert!(f.root.join("main/f/foo/foo_1.0.dsc").symlink_metadata().is_err());
        assert_consistent(&pool, "foo_1.0.dsc");

        // The model agrees with a fresh scan.
        let rescanned = f.pool()?;
        let rescanned_entry = rescanned.entry("foo_1.0.dsc").unwrap();
        assert_eq!(rescanned_entry.default_component(), entry.default_component());
        assert_eq!(rescanned_entry.symlink_components(), entry.symlink_components());

        Ok(())
    }

    #[test]
    fn remove_wrong_component_or_source() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;
        add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;

        assert!(matches!(
            pool.remove_file("universe", "foo", "foo_1.0.dsc"),
            Err(PublisherError::NotInPool(_, _))
        ));
        assert!(matches!(
            pool.remove_file("main", "bar", "foo_1.0.dsc"),
            Err(PublisherError::NotInPool(_, _))
        ));

        Ok(())
    }

    #[test]
    fn sanitise_moves_real_file_to_preferred() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;
        add(&mut pool, "multiverse", "foo_1.0.dsc", b"dsc")?;
        add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;
        add(&mut pool, "multiverse", "foo_1.0.tar.gz", b"tarball")?;

        pool.sanitise_links(&["main", "universe", "multiverse"])?;

        let entry = pool.entry("foo_1.0.dsc").unwrap();
        assert_eq!(entry.default_component(), "main");
        assert_eq!(
            entry.symlink_components().iter().collect::<Vec<_>>(),
            vec!["multiverse"]
        );
        assert!(f
            .root
            .join("multiverse/f/foo/foo_1.0.dsc")
            .symlink_metadata()?
            .file_type()
            .is_symlink());
        assert_consistent(&pool, "foo_1.0.dsc");

        // Files without symlinks are left alone.
        assert_eq!(
            pool.entry("foo_1.0.tar.gz").unwrap().default_component(),
            "multiverse"
        );

        // Already sanitised pools are unchanged.
        pool.sanitise_links(&["main", "universe", "multiverse"])?;
        assert_eq!(pool.entry("foo_1.0.dsc").unwrap().default_component(), "main");

        Ok(())
    }

    #[test]
    fn sanitise_relinks_all_symlinks() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;
        for component in ["multiverse", "universe", "restricted", "main"] {
            add(&mut pool, component, "foo_1.0.dsc", b"dsc")?;
        }

        pool.sanitise_links(&["main", "restricted"])?;

        assert_eq!(pool.entry("foo_1.0.dsc").unwrap().default_component(), "main");
        assert_consistent(&pool, "foo_1.0.dsc");
        assert_eq!(
            std::fs::read_link(f.root.join("universe/f/foo/foo_1.0.dsc"))?,
            PathBuf::from("../../../main/f/foo/foo_1.0.dsc")
        );

        Ok(())
    }

    #[test]
    fn content_not_matching_digest_is_rejected() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;

        let err = pool
            .add_file(
                "main",
                "foo",
                "foo_1.0.dsc",
                &sha1(b"claimed"),
                std::io::Cursor::new(b"actual"),
            )
            .unwrap_err();
        assert!(err.is_corruption());
        assert!(matches!(err, PublisherError::PoolContentMismatch { .. }));

        assert!(pool.entry("foo_1.0.dsc").is_none());
        assert!(!f.root.join("main/f/foo/foo_1.0.dsc").exists());
        assert!(std::fs::read_dir(&f.temp)?.next().is_none());

        // The correct content is accepted afterwards and its own digest is cached.
        assert_eq!(add(&mut pool, "main", "foo_1.0.dsc", b"actual")?, PoolAddOutcome::Added(6));
        assert_eq!(
            pool.entry("foo_1.0.dsc").unwrap().file_hash(),
            Some(&sha1(b"actual"))
        );
        assert_eq!(
            pool.check_before_add("main", "foo", "foo_1.0.dsc", &sha1(b"actual"))?,
            PoolAddCheck::AlreadyPresent
        );

        Ok(())
    }

    #[test]
    fn killed_writer_leaves_no_pool_file() -> Result<()> {
        let f = Fixture::new()?;

        {
            let mut pool = f.pool()?;
            let mut writer = pool.open_for_add("main", "foo", "foo_1.0.dsc")?;
            writer.write_all(b"partial")?;
            // No destructors run when the process dies.
            std::mem::forget(writer);
        }

        assert!(!f.root.join("main/f/foo/foo_1.0.dsc").exists());

        let mut leftovers = std::fs::read_dir(&f.temp)?.collect::<std::io::Result<Vec<_>>>()?;
        assert_eq!(leftovers.len(), 1);
        let leftover = leftovers.remove(0).file_name();
        assert!(leftover.to_string_lossy().starts_with("temp-download."));

        let pool = f.pool()?;
        assert!(pool.entry("foo_1.0.dsc").is_none());
        assert_eq!(pool.stats(), PoolStats::default());

        Ok(())
    }

    #[test]
    fn stats_follow_removals() -> Result<()> {
        let f = Fixture::new()?;
        let mut pool = f.pool()?;
        add(&mut pool, "main", "foo_1.0.dsc", b"dsc")?;
        add(&mut pool, "universe", "foo_1.0.dsc", b"dsc")?;
        add(&mut pool, "main", "foo_1.0.tar.gz", b"tarball")?;

        assert_eq!(
            pool.stats(),
            PoolStats {
                entries: 2,
                components: 2,
                files: 2,
                symlinks: 1
            }
        );

        pool.remove_file("universe", "foo", "foo_1.0.dsc")?;
        assert_eq!(
            pool.stats(),
            PoolStats {
                entries: 2,
                components: 1,
                files: 2,
                symlinks: 0
            }
        );

        pool.remove_file("main", "foo", "foo_1.0.tar.gz")?;
        assert_eq!(pool.stats().files, 1);

        Ok(())
    }
}
