mod common;

use common::*;
use std::fs;
use std::path::Path;

use salvage_core::domain::{Outcome, Snapshot};
use salvage_core::repo::OpenParams;
use salvage_core::repo_factory::{Backend, open_keys, open_service};
use salvage_core::repo_fs::{BackupEntry, Catalog};
use salvage_core::{Downloader, FileFilter, SalvageError, SnapshotPathMapper};

/// Catalog with a backup whose baseline snapshot was never written, plus an
/// unauthorized copy of it.
fn seed(root: &Path) -> Vec<u8> {
    let key = [0x11u8; 32];
    let secret = sample(42, 300);
    let sealed = seal_file(&key, &secret);
    let (mut group, bodies) = pack(
        "blobs",
        &[(sig(1), sample(1, 70)), (sig(2), sealed.clone())],
        64,
        20,
    );
    fs::create_dir_all(root.join("blobs")).unwrap();
    for (host, body) in bodies {
        fs::write(root.join(&host), body).unwrap();
    }
    for c in &mut group.containers {
        c.host = format!("file:///{}", c.host);
    }

    let mut locked = fd(sig(2), sealed.len() as u64, "HomeDomain", "Library/secret.plist");
    locked.encryption_key = Some(vec![0xab; 4]);
    locked.decrypted_size = secret.len() as u64;
    let files = vec![fd(sig(1), 70, "HomeDomain", "Documents/a.txt"), locked];

    let entry = BackupEntry {
        snapshots: vec![
            Snapshot {
                id: 3,
                committed: false,
                files: files.clone(),
            },
            Snapshot {
                id: 5,
                committed: true,
                files,
            },
        ],
        groups: vec![group],
        unauthorized: false,
    };
    let mut catalog = Catalog::default();
    catalog.backups.insert("dev".into(), entry.clone());
    catalog.backups.insert(
        "locked".into(),
        BackupEntry {
            unauthorized: true,
            ..entry
        },
    );
    catalog.keys.insert("abababab".into(), hex::encode(key));
    catalog.save(root).unwrap();
    secret
}

fn open(root: &Path, out: &Path) -> Downloader {
    let params = OpenParams {
        root: root.to_path_buf(),
    };
    let keys = open_keys(Backend::Fs, &params).unwrap();
    let service = open_service(Backend::Fs, params).unwrap();
    Downloader::new(
        service,
        keys,
        std::sync::Arc::new(SnapshotPathMapper::new(out)),
        fast_opts(),
    )
}

#[test]
fn restores_latest_snapshot_from_catalog() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let secret = seed(repo.path());

    let report = open(repo.path(), out.path())
        .download("dev", -1, &FileFilter::default())
        .unwrap();
    assert_eq!(report.snapshot, 5);
    assert_eq!(report.summary.get(Outcome::Success), 1);
    assert_eq!(report.summary.get(Outcome::SuccessDecrypted), 1);

    let home = out.path().join("5/HomeDomain");
    assert_eq!(fs::read(home.join("Documents/a.txt")).unwrap(), sample(1, 70));
    assert_eq!(fs::read(home.join("Library/secret.plist")).unwrap(), secret);
}

#[test]
fn missing_baseline_is_hunted_forward() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    seed(repo.path());

    let d = open(repo.path(), out.path());
    // 3 is uncommitted but its listing exists; it stands in for 1.
    assert_eq!(d.resolve("dev", 1).unwrap().id, 3);
    assert_eq!(d.resolve("dev", 0).unwrap().id, 5);
    assert!(matches!(
        d.resolve("dev", 4),
        Err(SalvageError::SnapshotUnavailable(4))
    ));
}

#[test]
fn unauthorized_backup_aborts_without_failing_files() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    seed(repo.path());

    let d = open(repo.path(), out.path());
    let snap = d.resolve("locked", -1).unwrap();
    let mut session = d.session("locked", snap, &FileFilter::default());
    assert!(matches!(session.run(), Err(SalvageError::Authentication(_))));
    assert_eq!(session.report().failed_files.len(), 0);
    assert!(!out.path().join("5/HomeDomain/Documents/a.txt").exists());
}
