// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Content digests of pool files.

The content store hands the pool a digest for every file it adds. The pool compares
that against digests of files already on disk, so both sides must agree on the
checksum flavor.
*/

use {
    crate::error::{PublisherError, Result},
    digest::DynDigest,
    serde::{Deserialize, Serialize},
    std::{
        fmt::{Display, Formatter},
        io::{Read, Write},
        path::Path,
        str::FromStr,
    },
};

/// A content digest flavor.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,

    /// SHA-256.
    Sha256,
}

impl Default for ChecksumType {
    fn default() -> Self {
        Self::Sha1
    }
}

impl ChecksumType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Obtain a new hasher for this checksum flavor.
    pub fn new_hasher(&self) -> Box<dyn DynDigest + Send> {
        match self {
            Self::Md5 => Box::new(md5::Md5::default()),
            Self::Sha1 => Box::new(sha1::Sha1::default()),
            Self::Sha256 => Box::new(sha2::Sha256::default()),
        }
    }

    /// Compute the digest of all content from a reader.
    pub fn digest_reader(&self, mut reader: impl Read) -> std::io::Result<ContentDigest> {
        let mut hasher = self.new_hasher();
        let mut buf = [0u8; 16384];

        loop {
            let size = reader.read(&mut buf)?;
            if size == 0 {
                break;
            }

            hasher.update(&buf[0..size]);
        }

        Ok(ContentDigest {
            checksum: *self,
            digest: hasher.finalize().to_vec(),
        })
    }

    /// Compute the digest of the file at the given path, following symlinks.
    pub fn digest_path(&self, path: &Path) -> Result<ContentDigest> {
        let fh = std::fs::File::open(path)
            .map_err(|e| PublisherError::PoolIoPath(format!("{}", path.display()), e))?;

        self.digest_reader(std::io::BufReader::new(fh))
            .map_err(|e| PublisherError::PoolIoPath(format!("{}", path.display()), e))
    }
}

impl FromStr for ChecksumType {
    type Err = PublisherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(PublisherError::UnknownChecksumType(s.to_string())),
        }
    }
}

/// Represents a content digest.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct ContentDigest {
    checksum: ChecksumType,
    digest: Vec<u8>,
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self.checksum, self.digest_hex())
    }
}

impl Display for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.checksum.name(), self.digest_hex())
    }
}

impl ContentDigest {
    /// Obtain an instance by parsing a hex string as a [ChecksumType].
    pub fn from_hex_digest(checksum: ChecksumType, digest: &str) -> Result<Self> {
        let digest = hex::decode(digest)
            .map_err(|e| PublisherError::ContentDigestBadHex(digest.to_string(), e))?;

        Ok(Self { checksum, digest })
    }

    /// Create a new SHA-1 instance by parsing a hex digest.
    pub fn sha1_hex(digest: &str) -> Result<Self> {
        Self::from_hex_digest(ChecksumType::Sha1, digest)
    }

    /// Compute the digest of in-memory data.
    pub fn from_data(checksum: ChecksumType, data: &[u8]) -> Self {
        let mut hasher = checksum.new_hasher();
        hasher.update(data);

        Self {
            checksum,
            digest: hasher.finalize().to_vec(),
        }
    }

    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum
    }

    pub fn digest_bytes(&self) -> &[u8] {
        &self.digest
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

/// A [Write] adapter computing a [ContentDigest] of everything written through it.
pub struct DigestingWriter<W> {
    checksum: ChecksumType,
    hasher: Box<dyn DynDigest + Send>,
    dest: W,
}

impl<W> DigestingWriter<W> {
    pub fn new(dest: W, checksum: ChecksumType) -> Self {
        Self {
            checksum,
            hasher: checksum.new_hasher(),
            dest,
        }
    }

    /// Finish the stream, returning the destination writer and the digest of its content.
    pub fn finish(self) -> (W, ContentDigest) {
        (
            self.dest,
            ContentDigest {
                checksum: self.checksum,
                digest: self.hasher.finalize().to_vec(),
            },
        )
    }
}

impl<W: Write> Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let size = self.dest.write(buf)?;
        self.hasher.update(&buf[0..size]);

        Ok(size)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.dest.flush()
    }
}
