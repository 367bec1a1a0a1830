// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use {crate::package_version::VersionError, thiserror::Error};

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("pool I/O error on path {0}: {1:?}")]
    PoolIoPath(String, std::io::Error),

    #[error("error walking pool directory: {0:?}")]
    WalkDir(#[from] walkdir::Error),

    #[error("YAML error: {0:?}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("version parsing error: {0}")]
    Version(#[from] VersionError),

    #[error("hex parsing error for digest {0}: {1:?}")]
    ContentDigestBadHex(String, hex::FromHexError),

    #[error("unknown checksum type: {0}")]
    UnknownChecksumType(String),

    #[error("unknown pool layout: {0}")]
    UnknownPoolLayout(String),

    #[error("no component given and no default component configured")]
    UnconfiguredComponent,

    #[error("source package name is empty")]
    EmptySourceName,

    #[error("malformed pool path: {0}")]
    MalformedPoolPath(String),

    #[error("pool temporary directory {0} must not be inside the pool root")]
    PoolTempDirInsideRoot(String),

    #[error(
        "{filename} ({component}/{source_package}) already exists in the pool with different \
         content: expected {expected}, found {actual}"
    )]
    PoolFileOverwrite {
        filename: String,
        component: String,
        source_package: String,
        expected: String,
        actual: String,
    },

    #[error("content written for {filename} does not match its digest: expected {expected}, found {actual}")]
    PoolContentMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("{1} is not in the pool for component {0}")]
    NotInPool(String, String),

    #[error("{0} is not a known pool entry")]
    PoolEntryMissing(String),

    #[error("pool target path already exists: {0}")]
    PoolTargetExists(String),

    #[error("unknown pocket: {0}")]
    UnknownPocket(String),

    #[error("malformed suite name: {0}")]
    MalformedSuite(String),

    #[error("publication store error: {0}")]
    PublicationStore(String),

    #[error("run lock {0} is held by another process")]
    LockHeld(String),
}

impl PublisherError {
    /// Whether this error indicates corrupt archive content rather than a pool bug.
    ///
    /// These must be reported to a human and never retried automatically.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::PoolFileOverwrite { .. } | Self::PoolContentMismatch { .. }
        )
    }
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, PublisherError>;
