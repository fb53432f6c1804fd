//! Pre-change snapshots of the service's persisted state and configuration
//!
//! # Directory Structure
//!
//! ```text
//! backup_dir/
//! └── 20261016T120000.123456Z/
//!     ├── state.tar.gz     # Contents of the state directory
//!     ├── config           # Byte copy of the configuration file
//!     └── manifest.json    # Id, domain, creation time, source paths
//! ```
//!
//! A snapshot is assembled under `<id>.partial` and renamed into place only
//! after every file has been synced, so a listed backup is always complete.
//! Backups are never deleted here.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{BackupError, RestoreError};

const ID_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";
const ARCHIVE_NAME: &str = "state.tar.gz";
const CONFIG_NAME: &str = "config";
const MANIFEST_NAME: &str = "manifest.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// A durable snapshot taken before the destructive phase of a rotation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    /// Sortable, timestamp-derived identifier
    pub id: String,
    /// Domain of the rotation that took the snapshot
    pub domain: String,
    pub created_at: DateTime<Utc>,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    /// Location of the snapshot on disk
    #[serde(skip)]
    pub path: PathBuf,
}

impl Backup {
    /// Compressed archive of the state directory
    pub fn archive_path(&self) -> PathBuf {
        self.path.join(ARCHIVE_NAME)
    }

    /// Copy of the configuration file
    pub fn config_copy_path(&self) -> PathBuf {
        self.path.join(CONFIG_NAME)
    }
}

/// Parse a backup id back into its timestamp
pub fn parse_backup_id(id: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(id, ID_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn format_backup_id(at: DateTime<Utc>) -> String {
    at.format(ID_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    backup_dir: PathBuf,
    state_dir: PathBuf,
    config_path: PathBuf,
}

impl BackupStore {
    pub fn new(
        backup_dir: impl Into<PathBuf>,
        state_dir: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            state_dir: state_dir.into(),
            config_path: config_path.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Archive the state directory and copy the configuration file
    pub fn snapshot(&self, domain: &str) -> Result<Backup, BackupError> {
        let state_meta = fs::metadata(&self.state_dir).map_err(|source| {
            BackupError::SourceInaccessible {
                path: self.state_dir.clone(),
                source,
            }
        })?;
        if !state_meta.is_dir() {
            return Err(BackupError::SourceInaccessible {
                path: self.state_dir.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            });
        }
        File::open(&self.config_path).map_err(|source| BackupError::SourceInaccessible {
            path: self.config_path.clone(),
            source,
        })?;

        fs::create_dir_all(&self.backup_dir).map_err(|source| BackupError::Write {
            id: String::new(),
            source,
        })?;

        let id = self.next_id();
        let write_err = |source| BackupError::Write {
            id: id.clone(),
            source,
        };

        let final_path = self.backup_dir.join(&id);
        let partial_path = self.backup_dir.join(format!("{}{}", id, PARTIAL_SUFFIX));
        fs::create_dir(&partial_path).map_err(write_err)?;

        let mut backup = Backup {
            id: id.clone(),
            domain: domain.to_string(),
            created_at: Utc::now(),
            state_dir: self.state_dir.clone(),
            config_path: self.config_path.clone(),
            path: partial_path.clone(),
        };

        let result = self.write_snapshot(&backup);
        if let Err(e) = result {
            if let Err(cleanup) = fs::remove_dir_all(&partial_path) {
                warn!(path = %partial_path.display(), "Failed to remove partial backup: {}", cleanup);
            }
            return Err(e);
        }

        fs::rename(&partial_path, &final_path).map_err(write_err)?;
        sync_dir(&self.backup_dir).map_err(write_err)?;
        backup.path = final_path;

        info!(
            backup_id = %backup.id,
            path = %backup.path.display(),
            "Backup created"
        );
        Ok(backup)
    }

    fn write_snapshot(&self, backup: &Backup) -> Result<(), BackupError> {
        let write_err = |source| BackupError::Write {
            id: backup.id.clone(),
            source,
        };

        let archive = File::create(backup.archive_path()).map_err(write_err)?;
        let encoder = GzEncoder::new(archive, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);
        builder
            .append_dir_all(".", &self.state_dir)
            .map_err(|source| BackupError::SourceInaccessible {
                path: self.state_dir.clone(),
                source,
            })?;
        let encoder = builder.into_inner().map_err(write_err)?;
        let archive = encoder.finish().map_err(write_err)?;
        archive.sync_all().map_err(write_err)?;

        let config_copy = backup.config_copy_path();
        fs::copy(&self.config_path, &config_copy).map_err(|source| {
            BackupError::SourceInaccessible {
                path: self.config_path.clone(),
                source,
            }
        })?;
        File::open(&config_copy)
            .and_then(|f| f.sync_all())
            .map_err(write_err)?;

        let manifest = serde_json::to_vec_pretty(backup)?;
        let mut file = File::create(backup.path.join(MANIFEST_NAME)).map_err(write_err)?;
        file.write_all(&manifest).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;

        sync_dir(&backup.path).map_err(write_err)
    }

    /// A fresh id strictly greater than every existing one
    fn next_id(&self) -> String {
        let mut at = Utc::now();
        if let Some(latest) = self.ids().ok().and_then(|ids| ids.into_iter().max()) {
            if let Some(latest_at) = parse_backup_id(&latest) {
                if latest_at >= at {
                    at = latest_at + Duration::microseconds(1);
                }
            }
        }
        loop {
            let id = format_backup_id(at);
            let taken = self.backup_dir.join(&id).exists()
                || self
                    .backup_dir
                    .join(format!("{}{}", id, PARTIAL_SUFFIX))
                    .exists();
            if !taken {
                return id;
            }
            at += Duration::microseconds(1);
        }
    }

    /// Ids of all complete backups, unordered
    fn ids(&self) -> Result<Vec<String>, RestoreError> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(RestoreError::Io {
                    path: self.backup_dir.clone(),
                    source,
                })
            }
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RestoreError::Io {
                path: self.backup_dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if parse_backup_id(&name).is_some() && entry.path().is_dir() {
                ids.push(name);
            } else {
                debug!(entry = %name, "Ignoring non-backup entry");
            }
        }
        Ok(ids)
    }

    /// All backups, newest first
    pub fn list(&self) -> Result<Vec<Backup>, RestoreError> {
        let mut ids = self.ids()?;
        ids.sort_by_key(|id| std::cmp::Reverse(parse_backup_id(id)));
        ids.iter().map(|id| self.load(id)).collect()
    }

    /// Most recent backup, ordered by the timestamp in its id
    pub fn latest(&self) -> Result<Backup, RestoreError> {
        let latest = self
            .ids()?
            .into_iter()
            .max_by_key(|id| parse_backup_id(id))
            .ok_or_else(|| RestoreError::NoBackup(self.backup_dir.clone()))?;
        self.load(&latest)
    }

    fn load(&self, id: &str) -> Result<Backup, RestoreError> {
        let path = self.backup_dir.join(id);
        if parse_backup_id(id).is_none() || !path.is_dir() {
            return Err(RestoreError::UnknownBackup(id.to_string()));
        }

        let manifest = fs::read(path.join(MANIFEST_NAME)).ok();
        let mut backup = match manifest.and_then(|m| serde_json::from_slice::<Backup>(&m).ok()) {
            Some(backup) => backup,
            None => {
                warn!(backup_id = id, "Backup manifest missing or unreadable");
                Backup {
                    id: id.to_string(),
                    domain: String::new(),
                    created_at: parse_backup_id(id).unwrap_or_else(Utc::now),
                    state_dir: self.state_dir.clone(),
                    config_path: self.config_path.clone(),
                    path: PathBuf::new(),
                }
            }
        };
        backup.path = path;
        Ok(backup)
    }

    /// Restore the most recent backup over the live state and configuration
    pub fn restore_latest(&self) -> Result<Backup, RestoreError> {
        let backup = self.latest()?;
        self.restore_backup(&backup)?;
        Ok(backup)
    }

    /// Restore an explicit backup
    pub fn restore(&self, id: &str) -> Result<Backup, RestoreError> {
        let backup = self.load(id)?;
        self.restore_backup(&backup)?;
        Ok(backup)
    }

    fn restore_backup(&self, backup: &Backup) -> Result<(), RestoreError> {
        let archive = backup.archive_path();
        let config_copy = backup.config_copy_path();
        if !archive.is_file() {
            return Err(RestoreError::Incomplete {
                id: backup.id.clone(),
                missing: ARCHIVE_NAME,
            });
        }
        if !config_copy.is_file() {
            return Err(RestoreError::Incomplete {
                id: backup.id.clone(),
                missing: CONFIG_NAME,
            });
        }

        let extract_err = |source| RestoreError::Extract {
            id: backup.id.clone(),
            source,
        };

        info!(backup_id = %backup.id, "Restoring backup");

        // Unpack next to the live directory so the swap is a rename
        let staging = sibling(&self.state_dir, &format!("restore-{}", backup.id));
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(extract_err)?;
        }
        fs::create_dir_all(&staging).map_err(extract_err)?;
        let unpacked = File::open(&archive).and_then(|file| {
            let mut tar = tar::Archive::new(GzDecoder::new(file));
            tar.set_preserve_permissions(true);
            tar.set_overwrite(true);
            tar.unpack(&staging)
        });
        if let Err(source) = unpacked {
            let _ = fs::remove_dir_all(&staging);
            return Err(extract_err(source));
        }

        if let Some(mode) = archive_root_mode(&archive) {
            set_mode(&staging, mode);
        }

        let displaced = sibling(&self.state_dir, &format!("displaced-{}", backup.id));
        if self.state_dir.exists() {
            fs::rename(&self.state_dir, &displaced).map_err(extract_err)?;
        }
        if let Err(source) = fs::rename(&staging, &self.state_dir) {
            // Put the displaced directory back before giving up
            if displaced.exists() {
                reinstate(&displaced, &self.state_dir, &backup.id);
            }
            return Err(extract_err(source));
        }
        if displaced.exists() {
            if let Err(e) = fs::remove_dir_all(&displaced) {
                warn!(path = %displaced.display(), "Failed to remove displaced state directory: {}", e);
            }
        }

        let config_tmp = sibling(&self.config_path, &format!("restore-{}", backup.id));
        fs::copy(&config_copy, &config_tmp)
            .and_then(|_| File::open(&config_tmp)?.sync_all())
            .map_err(extract_err)?;
        fs::rename(&config_tmp, &self.config_path).map_err(extract_err)?;

        info!(
            backup_id = %backup.id,
            state_dir = %self.state_dir.display(),
            config = %self.config_path.display(),
            "Backup restored"
        );
        Ok(())
    }
}

/// `/a/b/name` -> `/a/b/.name.<tag>`
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, tag))
}

/// Mode recorded for the archive's `./` entry
fn archive_root_mode(archive: &Path) -> Option<u32> {
    let file = File::open(archive).ok()?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut entries = tar.entries().ok()?;
    let first = entries.next()?.ok()?;
    let path = first.path().ok()?;
    if path.as_os_str().is_empty() || path == Path::new(".") || path == Path::new("./") {
        first.header().mode().ok()
    } else {
        None
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!(path = %path.display(), "Failed to restore directory mode: {}", e);
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(path)?.sync_all()
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Move a displaced live directory back into place after a failed swap
///
/// On failure the data stays at `displaced`; the error log names it for
/// manual recovery.
fn reinstate(displaced: &Path, state_dir: &Path, backup_id: &str) -> bool {
    match fs::rename(displaced, state_dir) {
        Ok(()) => true,
        Err(e) => {
            error!(
                backup_id,
                displaced = %displaced.display(),
                state_dir = %state_dir.display(),
                "Failed to put the live state directory back: {}; previous state is at {}",
                e,
                displaced.display()
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        store: BackupStore,
        state_dir: PathBuf,
        config_path: PathBuf,
        backup_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let state_dir = root.path().join("state");
        let config_path = root.path().join("service.yaml");
        let backup_dir = root.path().join("backups");
        fs::create_dir_all(state_dir.join("tls")).unwrap();
        fs::write(state_dir.join("tls/fullchain.pem"), "old chain").unwrap();
        fs::write(state_dir.join("cluster.db"), [0u8, 1, 2, 3, 255]).unwrap();
        fs::create_dir_all(state_dir.join("empty")).unwrap();
        fs::write(&config_path, "public_addr: old.example.com:443\n").unwrap();

        Fixture {
            store: BackupStore::new(&backup_dir, &state_dir, &config_path),
            _root: root,
            state_dir,
            config_path,
            backup_dir,
        }
    }

    #[test]
    fn test_backup_id_round_trip_and_ordering() {
        let early = Utc::now();
        let late = early + Duration::microseconds(1);
        let early_id = format_backup_id(early);
        let late_id = format_backup_id(late);
        assert!(early_id < late_id);
        assert_eq!(parse_backup_id(&late_id).unwrap().timestamp_micros(), late.timestamp_micros());
        assert!(parse_backup_id("not-a-backup").is_none());
        assert!(parse_backup_id(&format!("{}.partial", early_id)).is_none());
    }

    #[test]
    fn test_snapshot_writes_artifacts() {
        let f = fixture();
        let backup = f.store.snapshot("example.com").unwrap();

        assert_eq!(backup.path, f.backup_dir.join(&backup.id));
        assert!(backup.archive_path().is_file());
        assert_eq!(
            fs::read(backup.config_copy_path()).unwrap(),
            fs::read(&f.config_path).unwrap()
        );
        let manifest: Backup =
            serde_json::from_slice(&fs::read(backup.path.join(MANIFEST_NAME)).unwrap()).unwrap();
        assert_eq!(manifest.id, backup.id);
        assert_eq!(manifest.domain, "example.com");
    }

    #[test]
    fn test_snapshot_fails_without_config() {
        let f = fixture();
        fs::remove_file(&f.config_path).unwrap();

        let result = f.store.snapshot("example.com");
        assert!(matches!(result, Err(BackupError::SourceInaccessible { .. })));
        assert!(f.store.list().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_fails_without_state_dir() {
        let f = fixture();
        fs::remove_dir_all(&f.state_dir).unwrap();

        let result = f.store.snapshot("example.com");
        assert!(matches!(result, Err(BackupError::SourceInaccessible { .. })));
    }

    #[test]
    fn test_restore_latest_is_byte_identical() {
        let f = fixture();
        f.store.snapshot("example.com").unwrap();

        fs::remove_dir_all(&f.state_dir).unwrap();
        fs::create_dir_all(&f.state_dir).unwrap();
        fs::write(f.state_dir.join("junk"), "new").unwrap();
        fs::write(&f.config_path, "public_addr: new.example.com:443\n").unwrap();

        f.store.restore_latest().unwrap();

        assert_eq!(
            fs::read_to_string(&f.config_path).unwrap(),
            "public_addr: old.example.com:443\n"
        );
        assert_eq!(
            fs::read(f.state_dir.join("tls/fullchain.pem")).unwrap(),
            b"old chain"
        );
        assert_eq!(
            fs::read(f.state_dir.join("cluster.db")).unwrap(),
            vec![0u8, 1, 2, 3, 255]
        );
        assert!(f.state_dir.join("empty").is_dir());
        assert!(!f.state_dir.join("junk").exists());
    }

    #[test]
    fn test_restore_latest_picks_newest_id() {
        let f = fixture();
        let first = f.store.snapshot("example.com").unwrap();
        fs::write(&f.config_path, "second\n").unwrap();
        let second = f.store.snapshot("example.com").unwrap();
        assert!(second.id > first.id);

        fs::write(&f.config_path, "third\n").unwrap();
        let restored = f.store.restore_latest().unwrap();
        assert_eq!(restored.id, second.id);
        assert_eq!(fs::read_to_string(&f.config_path).unwrap(), "second\n");

        let listed: Vec<_> = f.store.list().unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(listed, vec![second.id, first.id]);
    }

    #[test]
    fn test_restore_explicit_id() {
        let f = fixture();
        let first = f.store.snapshot("example.com").unwrap();
        fs::write(&f.config_path, "second\n").unwrap();
        f.store.snapshot("example.com").unwrap();

        f.store.restore(&first.id).unwrap();
        assert_eq!(
            fs::read_to_string(&f.config_path).unwrap(),
            "public_addr: old.example.com:443\n"
        );
        assert!(matches!(
            f.store.restore("20000101T000000.000000Z"),
            Err(RestoreError::UnknownBackup(_))
        ));
    }

    #[test]
    fn test_restore_without_backup_fails() {
        let f = fixture();
        assert!(matches!(
            f.store.restore_latest(),
            Err(RestoreError::NoBackup(_))
        ));
    }

    #[test]
    fn test_restore_with_missing_archive_fails() {
        let f = fixture();
        let backup = f.store.snapshot("example.com").unwrap();
        fs::remove_file(backup.archive_path()).unwrap();
        fs::write(&f.config_path, "changed\n").unwrap();

        let result = f.store.restore_latest();
        assert!(matches!(result, Err(RestoreError::Incomplete { .. })));
        assert_eq!(fs::read_to_string(&f.config_path).unwrap(), "changed\n");
    }

    #[test]
    fn test_partial_and_foreign_entries_ignored() {
        let f = fixture();
        let backup = f.store.snapshot("example.com").unwrap();
        fs::create_dir_all(f.backup_dir.join("29991231T000000.000000Z.partial")).unwrap();
        fs::create_dir_all(f.backup_dir.join("notes")).unwrap();

        assert_eq!(f.store.latest().unwrap().id, backup.id);
    }

    #[test]
    fn test_next_id_is_monotonic_after_future_backup() {
        let f = fixture();
        let future = "29991231T000000.000000Z";
        fs::create_dir_all(f.backup_dir.join(future)).unwrap();

        let backup = f.store.snapshot("example.com").unwrap();
        assert!(backup.id.as_str() > future);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_preserved() {
        let f = fixture();
        std::os::unix::fs::symlink("tls/fullchain.pem", f.state_dir.join("current.pem")).unwrap();
        f.store.snapshot("example.com").unwrap();
        fs::remove_file(f.state_dir.join("current.pem")).unwrap();

        f.store.restore_latest().unwrap();
        let link = fs::read_link(f.state_dir.join("current.pem")).unwrap();
        assert_eq!(link, PathBuf::from("tls/fullchain.pem"));
    }

    #[test]
    fn test_reinstate_displaced_state() {
        let root = TempDir::new().unwrap();
        let displaced = root.path().join(".state.displaced-x");
        let state_dir = root.path().join("state");
        fs::create_dir_all(&displaced).unwrap();
        fs::write(displaced.join("cluster.db"), "live").unwrap();

        assert!(reinstate(&displaced, &state_dir, "x"));
        assert_eq!(fs::read_to_string(state_dir.join("cluster.db")).unwrap(), "live");
        assert!(!displaced.exists());

        // Nothing left to move: reported, not swallowed
        assert!(!reinstate(&displaced, &state_dir, "x"));
        assert!(state_dir.join("cluster.db").exists());
    }
}
