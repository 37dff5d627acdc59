//! Build context packaging.
//!
//! Serializes a workspace into a gzipped tar archive while computing a
//! sha256 digest over the exact bytes written, in a single pass. Traversal
//! order is stable and the gzip header carries no timestamp, so repeated
//! runs over an unchanged workspace produce identical digests.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest as _, Sha256};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::config::Artifact;
use crate::digest::Digest;
use crate::error::PackageError;

/// Immutable input to one packaging run.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Workspace root; archived paths are relative to it.
    pub workspace: PathBuf,
    /// Build instruction file, relative to the workspace. Always included
    /// even when `files` omits it.
    pub dockerfile: Option<PathBuf>,
    /// Restricts packaging to these relative paths. `None` packages every
    /// regular file under the workspace.
    pub files: Option<Vec<PathBuf>>,
}

/// A packaged context archive and its content digest.
///
/// The archive lives in a temporary file that is removed when this value
/// is dropped, so it must outlive the upload that reads it.
#[derive(Debug)]
pub struct PackagedContext {
    archive: NamedTempFile,
    digest: Digest,
}

impl PackagedContext {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Local path of the archive file.
    pub fn path(&self) -> &Path {
        self.archive.path()
    }

    /// Digest-derived file name the archive is staged under.
    pub fn file_name(&self) -> String {
        self.digest.archive_file_name()
    }
}

/// Package a build context into a tar.gz archive, digesting as it streams.
pub async fn package(context: BuildContext) -> Result<PackagedContext, PackageError> {
    tokio::task::spawn_blocking(move || package_blocking(&context))
        .await
        .map_err(|e| PackageError::Worker {
            reason: e.to_string(),
        })?
}

fn package_blocking(context: &BuildContext) -> Result<PackagedContext, PackageError> {
    let files = match &context.files {
        Some(listed) => restricted_files(listed, context.dockerfile.as_deref()),
        None => workspace_files(&context.workspace)?,
    };

    let mut archive = NamedTempFile::new()?;
    let digest = {
        let tee = TeeWriter::new(archive.as_file_mut());
        let encoder = GzEncoder::new(tee, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        for relative in &files {
            let source = context.workspace.join(relative);
            builder
                .append_path_with_name(&source, relative)
                .map_err(|e| PackageError::Archive {
                    path: relative.clone(),
                    reason: e.to_string(),
                })?;
        }

        let encoder = builder.into_inner()?;
        let mut tee = encoder.finish()?;
        tee.flush()?;
        tee.into_digest()
    };

    Ok(PackagedContext { archive, digest })
}

/// Every regular file under `root`, as sorted workspace-relative paths.
pub fn workspace_files(root: &Path) -> Result<Vec<PathBuf>, PackageError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| PackageError::Workspace {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| PackageError::Workspace {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?
            .to_path_buf();
        files.push(relative);
    }
    Ok(files)
}

fn restricted_files(listed: &[PathBuf], dockerfile: Option<&Path>) -> Vec<PathBuf> {
    let mut files = listed.to_vec();
    if let Some(dockerfile) = dockerfile
        && !files.iter().any(|f| f == dockerfile)
    {
        files.push(dockerfile.to_path_buf());
    }
    files.sort();
    files.dedup();
    files
}

/// Writer that forwards bytes to `inner` while hashing them.
struct TeeWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> TeeWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn into_digest(self) -> Digest {
        Digest::sha256(hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for TeeWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Enumerates the files one artifact's build depends on.
///
/// The default source walks the whole workspace; language-aware sources can
/// narrow the context to what the build actually reads.
pub trait DependencySource: Send + Sync {
    /// Relative paths of the files to include in the context.
    fn dependencies(&self, artifact: &Artifact) -> Result<Vec<PathBuf>, PackageError>;
}

/// Dependency source that includes every file in the workspace.
pub struct WorkspaceWalker;

impl DependencySource for WorkspaceWalker {
    fn dependencies(&self, artifact: &Artifact) -> Result<Vec<PathBuf>, PackageError> {
        workspace_files(&artifact.workspace)
    }
}
