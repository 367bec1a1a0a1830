// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian archive publishing primitives.

This crate implements two stages of publishing a Debian-style package archive: keeping
the *pool* of archive files on disk consistent, and *dominating* publication records
so only the newest version of each package stays current.

# A Tour of Functionality

The [pool] module manages the pool. [pool::Poolifier] maps a source package and
component to a directory like `main/libf/libfoo`. [pool::atomic::AtomicFile] writes
files so they never appear at their final path half-written. [pool::DiskPool] holds an
in-memory model of which components publish which files, keeping one real copy of each
filename and relative symlinks in the other components. It is rebuilt from disk with
[pool::DiskPool::scan()].

The [publication] module defines publication records and the
[publication::PublicationStore] trait through which they are read and updated.
[publication::MemoryPublicationStore] keeps records in memory and can be loaded from
YAML.

The [domination] module implements [domination::Dominator], which supersedes older
publications of each package and schedules superseded publications for deletion once
nothing depends on them. Versions are ordered by [package_version::PackageVersion],
which implements Debian version comparison.

[config] defines YAML configuration. [lock::RunLock] provides the run-level mutual
exclusion pool operations require.

Physically deleting files whose publications are past their scheduled deletion date
is left to the caller, via [pool::DiskPool::remove_file()].
*/

pub mod config;
pub mod domination;
pub mod error;
pub mod io;
pub mod lock;
pub mod package_version;
pub mod pool;
pub mod publication;
