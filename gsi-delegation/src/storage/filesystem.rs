// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The filesystem backend.
//!
//! Entries live under the store's root directory:
//!
//! ```text
//! <root>/requests/<owner DN>/<cache ID>/{delegation_id, certreq.pem, privkey.pem, voms_attributes.json}
//! <root>/credentials/<owner DN>/<delegation ID>/{userproxy.pem, voms_attributes.json, termination_time}
//! ```
//!
//! Path components are percent-encoded so that no DN or ID can escape its directory.
//!
//! An entry directory is never modified once it is in place. Every write fills a hidden staging
//! directory and then renames it over the entry in one step (`renameat2` with `RENAME_NOREPLACE`
//! or `RENAME_EXCHANGE`), and readers read all files through a single handle on the entry
//! directory. A reader therefore sees one complete entry or another, never a mix. Hidden
//! directories left behind by a crash are never read. Files are created with mode 0600 and
//! directories with mode 0700.

use std::{
    fs::{self, DirBuilder, File, OpenOptions},
    io::{self, ErrorKind, Read, Write},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
};

use chrono::DateTime;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rustix::{
    fd::OwnedFd,
    fs::{Mode, OFlags, RenameFlags, CWD},
};
use tempfile::TempDir;
use tracing::instrument;

use super::{CredentialCache, DelegatedCredential, DelegationRequest, StorageError};

const REQUESTS: &str = "requests";
const CREDENTIALS: &str = "credentials";

const DELEGATION_ID_FILE: &str = "delegation_id";
const CERTIFICATE_REQUEST_FILE: &str = "certreq.pem";
const PRIVATE_KEY_FILE: &str = "privkey.pem";
const VOMS_ATTRIBUTES_FILE: &str = "voms_attributes.json";
const PROXY_FILE: &str = "userproxy.pem";
const TERMINATION_TIME_FILE: &str = "termination_time";

/// Everything except `[A-Za-z0-9_=+-]` is encoded.
///
/// Notably `/` and `.` are always encoded, so encoded values are never `.`, `..`, or hidden.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'=')
    .remove(b'+')
    .remove(b'-');

/// How many times a read starts over after the entry changed underneath it.
const READ_ATTEMPTS: usize = 16;

/// A [`CredentialCache`] stored in a directory tree.
#[derive(Debug, Clone)]
pub struct FilesystemCache {
    root: PathBuf,
}

impl FilesystemCache {
    /// Use `root` as the store, creating its directories if they don't exist.
    #[instrument(err)]
    pub async fn create(root: PathBuf) -> Result<Self, StorageError> {
        blocking(move || {
            create_private_dir_all(&root.join(REQUESTS))?;
            create_private_dir_all(&root.join(CREDENTIALS))?;
            Ok(Self { root })
        })
        .await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn request_parent(&self, owner_dn: &str) -> PathBuf {
        self.root.join(REQUESTS).join(encode_component(owner_dn))
    }

    fn credential_parent(&self, owner_dn: &str) -> PathBuf {
        self.root.join(CREDENTIALS).join(encode_component(owner_dn))
    }

    fn request_files(
        request: &DelegationRequest,
    ) -> Result<Vec<(&'static str, String)>, StorageError> {
        Ok(vec![
            (DELEGATION_ID_FILE, request.delegation_id.clone()),
            (CERTIFICATE_REQUEST_FILE, request.certificate_request.clone()),
            (PRIVATE_KEY_FILE, request.private_key.clone()),
            (
                VOMS_ATTRIBUTES_FILE,
                serde_json::to_string(&request.voms_attributes)?,
            ),
        ])
    }

    fn credential_files(
        credential: &DelegatedCredential,
    ) -> Result<Vec<(&'static str, String)>, StorageError> {
        Ok(vec![
            (PROXY_FILE, credential.certificate_chain.clone()),
            (
                VOMS_ATTRIBUTES_FILE,
                serde_json::to_string(&credential.voms_attributes)?,
            ),
            (
                TERMINATION_TIME_FILE,
                credential.termination_time.timestamp().to_string(),
            ),
        ])
    }
}

#[async_trait::async_trait]
impl CredentialCache for FilesystemCache {
    #[instrument(skip_all, fields(cache_id = request.cache_id))]
    async fn insert_request(&self, request: &DelegationRequest) -> Result<(), StorageError> {
        let parent = self.request_parent(&request.owner_dn);
        let name = encode_component(&request.cache_id);
        let files = Self::request_files(request)?;
        blocking(move || insert_entry(&parent, &name, &files)).await
    }

    #[instrument(skip_all, fields(cache_id = request.cache_id))]
    async fn update_request(&self, request: &DelegationRequest) -> Result<(), StorageError> {
        let parent = self.request_parent(&request.owner_dn);
        let name = encode_component(&request.cache_id);
        let files = Self::request_files(request)?;
        blocking(move || update_entry(&parent, &name, &files)).await
    }

    #[instrument(skip(self))]
    async fn find_request(
        &self,
        cache_id: &str,
        owner_dn: &str,
    ) -> Result<Option<DelegationRequest>, StorageError> {
        let directory = self
            .request_parent(owner_dn)
            .join(encode_component(cache_id));
        let cache_id = cache_id.to_string();
        let owner_dn = owner_dn.to_string();
        blocking(move || {
            read_entry(&directory, |entry| {
                Ok(DelegationRequest {
                    cache_id: cache_id.clone(),
                    delegation_id: entry.read(DELEGATION_ID_FILE)?,
                    owner_dn: owner_dn.clone(),
                    voms_attributes: serde_json::from_str(&entry.read(VOMS_ATTRIBUTES_FILE)?)?,
                    certificate_request: entry.read(CERTIFICATE_REQUEST_FILE)?,
                    private_key: entry.read(PRIVATE_KEY_FILE)?,
                })
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_request(&self, cache_id: &str, owner_dn: &str) -> Result<(), StorageError> {
        let parent = self.request_parent(owner_dn);
        let name = encode_component(cache_id);
        blocking(move || delete_entry(&parent, &name)).await
    }

    #[instrument(skip_all, fields(delegation_id = credential.delegation_id))]
    async fn insert_credential(
        &self,
        credential: &DelegatedCredential,
    ) -> Result<(), StorageError> {
        let parent = self.credential_parent(&credential.owner_dn);
        let name = encode_component(&credential.delegation_id);
        let files = Self::credential_files(credential)?;
        blocking(move || insert_entry(&parent, &name, &files)).await
    }

    #[instrument(skip_all, fields(delegation_id = credential.delegation_id))]
    async fn update_credential(
        &self,
        credential: &DelegatedCredential,
    ) -> Result<(), StorageError> {
        let parent = self.credential_parent(&credential.owner_dn);
        let name = encode_component(&credential.delegation_id);
        let files = Self::credential_files(credential)?;
        blocking(move || update_entry(&parent, &name, &files)).await
    }

    #[instrument(skip_all, fields(delegation_id = credential.delegation_id))]
    async fn store_credential(&self, credential: &DelegatedCredential) -> Result<(), StorageError> {
        let parent = self.credential_parent(&credential.owner_dn);
        let name = encode_component(&credential.delegation_id);
        let files = Self::credential_files(credential)?;
        blocking(move || store_entry(&parent, &name, &files)).await
    }

    #[instrument(skip(self))]
    async fn find_credential(
        &self,
        delegation_id: &str,
        owner_dn: &str,
    ) -> Result<Option<DelegatedCredential>, StorageError> {
        let directory = self
            .credential_parent(owner_dn)
            .join(encode_component(delegation_id));
        let delegation_id = delegation_id.to_string();
        let owner_dn = owner_dn.to_string();
        blocking(move || {
            read_entry(&directory, |entry| {
                let termination_time = entry.read(TERMINATION_TIME_FILE)?;
                let termination_time = termination_time
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
                    .ok_or_else(|| {
                        StorageError::Corrupt(format!(
                            "'{}' is not a valid termination time",
                            termination_time.trim()
                        ))
                    })?;
                Ok(DelegatedCredential {
                    delegation_id: delegation_id.clone(),
                    owner_dn: owner_dn.clone(),
                    voms_attributes: serde_json::from_str(&entry.read(VOMS_ATTRIBUTES_FILE)?)?,
                    certificate_chain: entry.read(PROXY_FILE)?,
                    termination_time,
                })
            })
        })
        .await
    }

    #[instrument(skip(self))]
    async fn delete_credential(
        &self,
        delegation_id: &str,
        owner_dn: &str,
    ) -> Result<(), StorageError> {
        let parent = self.credential_parent(owner_dn);
        let name = encode_component(delegation_id);
        blocking(move || delete_entry(&parent, &name)).await
    }
}

/// Run blocking filesystem work off the async runtime, within the current span.
async fn blocking<F, T>(work: F) -> Result<T, StorageError>
where
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
    T: Send + 'static,
{
    let span = tracing::Span::current();
    tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        work()
    })
    .await?
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

fn create_private_dir_all(path: &Path) -> Result<(), StorageError> {
    DirBuilder::new().recursive(true).mode(0o700).create(path)?;
    Ok(())
}

fn rename_with(from: &Path, to: &Path, flags: RenameFlags) -> io::Result<()> {
    rustix::fs::renameat_with(CWD, from, CWD, to, flags).map_err(io::Error::from)
}

/// A handle on one entry directory; every file is read relative to it.
struct EntryReader {
    directory: OwnedFd,
}

impl EntryReader {
    fn open(path: &Path) -> io::Result<Self> {
        let directory = rustix::fs::open(
            path,
            OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Self { directory })
    }

    fn read(&self, name: &str) -> Result<String, StorageError> {
        let file = rustix::fs::openat(
            &self.directory,
            name,
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(io::Error::from)?;
        let mut contents = String::new();
        File::from(file).read_to_string(&mut contents)?;
        Ok(contents)
    }
}

/// Read the entry at `directory`, or [`None`] if there is no entry.
///
/// A missing file means the entry was replaced or removed mid-read, so the read starts over. If
/// the file is still missing after [`READ_ATTEMPTS`] tries, the entry is corrupt.
fn read_entry<T>(
    directory: &Path,
    parse: impl Fn(&EntryReader) -> Result<T, StorageError>,
) -> Result<Option<T>, StorageError> {
    for _ in 0..READ_ATTEMPTS {
        let entry = match EntryReader::open(directory) {
            Ok(entry) => entry,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        match parse(&entry) {
            Err(StorageError::Io(error)) if error.kind() == ErrorKind::NotFound => {
                tracing::debug!(entry = %directory.display(), "Entry changed while reading it");
            }
            result => return result.map(Some),
        }
    }
    Err(StorageError::Corrupt(format!(
        "files are missing from {}",
        directory.display()
    )))
}

fn write_new_file(path: &Path, contents: &str) -> Result<(), StorageError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Write a complete entry into a hidden directory under `parent`.
///
/// The directory is removed when dropped; once it has been renamed into place there is nothing
/// left to remove.
fn stage_entry(parent: &Path, files: &[(&'static str, String)]) -> Result<TempDir, StorageError> {
    create_private_dir_all(parent)?;
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(parent)?;
    for (file_name, contents) in files {
        write_new_file(&staging.path().join(file_name), contents)?;
    }
    Ok(staging)
}

fn insert_entry(
    parent: &Path,
    name: &str,
    files: &[(&'static str, String)],
) -> Result<(), StorageError> {
    let staging = stage_entry(parent, files)?;
    let target = parent.join(name);
    rename_with(staging.path(), &target, RenameFlags::NOREPLACE)?;
    tracing::trace!(entry = %target.display(), "Stored new entry");
    Ok(())
}

fn update_entry(
    parent: &Path,
    name: &str,
    files: &[(&'static str, String)],
) -> Result<(), StorageError> {
    if !parent.is_dir() {
        return Err(StorageError::NotFound);
    }
    let staging = stage_entry(parent, files)?;
    let target = parent.join(name);
    match rename_with(staging.path(), &target, RenameFlags::EXCHANGE) {
        Err(error) if error.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
        result => result?,
    }
    // The staging directory now holds the replaced entry.
    staging.close()?;
    tracing::trace!(entry = %target.display(), "Replaced entry");
    Ok(())
}

fn store_entry(
    parent: &Path,
    name: &str,
    files: &[(&'static str, String)],
) -> Result<(), StorageError> {
    let staging = stage_entry(parent, files)?;
    let target = parent.join(name);
    // Each step fails only if a concurrent writer created or removed the entry in between.
    loop {
        match rename_with(staging.path(), &target, RenameFlags::NOREPLACE) {
            Ok(()) => {
                tracing::trace!(entry = %target.display(), "Stored new entry");
                return Ok(());
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error.into()),
        }
        match rename_with(staging.path(), &target, RenameFlags::EXCHANGE) {
            Ok(()) => {
                staging.close()?;
                tracing::trace!(entry = %target.display(), "Replaced entry");
                return Ok(());
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
    }
}

fn delete_entry(parent: &Path, name: &str) -> Result<(), StorageError> {
    if !parent.is_dir() {
        return Err(StorageError::NotFound);
    }
    // Move the entry out of the way in one step; the rest of the cleanup can't be observed.
    let trash = tempfile::Builder::new()
        .prefix(".deleted-")
        .tempdir_in(parent)?;
    match fs::rename(parent.join(name), trash.path().join(name)) {
        Err(error) if error.kind() == ErrorKind::NotFound => return Err(StorageError::NotFound),
        result => result?,
    }
    trash.close()?;
    Ok(())
}
