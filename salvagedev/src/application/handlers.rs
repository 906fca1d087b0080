use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use salvage_core::config::DownloadOptions;
use salvage_core::download::{DownloadReport, Downloader};
use salvage_core::error::Result;
use salvage_core::ledger::Outcomes;
use salvage_core::repo::{BackupService, OpenParams};
use salvage_core::repo_factory::{Backend, open_keys, open_service};
use salvage_core::select::FileFilter;
use salvage_core::snapshot::SnapshotResolver;
use salvage_core::{SalvageError, SnapshotPathMapper};
use tracing::debug;

pub struct RestoreArgs {
    pub root: PathBuf,
    pub backup: String,
    pub dest: PathBuf,
    pub snapshot: i64,
    pub config: Option<PathBuf>,
    pub threads: Option<usize>,
    pub retries: Option<u32>,
    pub domains: Vec<String>,
    pub extensions: Vec<String>,
}

pub fn handle_snapshots(root: PathBuf, backup: &str) -> Result<()> {
    let service = open_service(Backend::Fs, OpenParams { root })?;
    let infos = service.snapshots(backup)?;
    let resolver = SnapshotResolver::new(&infos);
    let latest = resolver.resolve(-1);
    for s in infos {
        let mark = if Some(s.id) == latest { "  (latest)" } else { "" };
        let state = if s.committed { "committed" } else { "incomplete" };
        println!("{:>6}  {:<10}{}", s.id, state, mark);
    }
    Ok(())
}

pub fn handle_files(root: PathBuf, backup: &str, snapshot: i64) -> Result<()> {
    let service = open_service(Backend::Fs, OpenParams { root: root.clone() })?;
    let keys = open_keys(Backend::Fs, &OpenParams { root })?;
    let downloader = Downloader::new(
        service,
        keys,
        Arc::new(SnapshotPathMapper::new(".")),
        DownloadOptions::default(),
    );
    let snap = downloader.resolve(backup, snapshot)?;
    eprintln!("files: snapshot {} ({} files)", snap.id, snap.files.len());
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for f in &snap.files {
        let enc = if f.is_encrypted() { "E" } else { "-" };
        writeln!(
            out,
            "{:>12}  {:>10}  {}  {}/{}",
            f.size, f.last_modified, enc, f.domain, f.relative_path
        )?;
    }
    Ok(())
}

pub fn handle_restore(a: RestoreArgs) -> Result<()> {
    let mut opts = match &a.config {
        Some(p) => DownloadOptions::from_json(p)?,
        None => DownloadOptions::default(),
    };
    if let Some(t) = a.threads {
        opts.threads = t;
    }
    if let Some(r) = a.retries {
        opts.retry_count = r;
    }
    opts.validate()?;

    let params = OpenParams { root: a.root };
    let keys = open_keys(Backend::Fs, &params)?;
    let service = open_service(Backend::Fs, params)?;
    let paths = Arc::new(SnapshotPathMapper::new(a.dest));
    let filter = FileFilter {
        domains: a.domains,
        extensions: a.extensions,
        ..Default::default()
    };

    let (tx, rx) = crossbeam_channel::unbounded::<Outcomes>();
    let downloader = Downloader::new(service, keys, paths, opts).with_progress(tx);
    let watcher = thread::spawn(move || {
        let mut settled = 0usize;
        for batch in rx {
            settled += batch.len();
            for (f, o) in &batch {
                debug!(path = %f.relative_path, outcome = ?o, "settled");
            }
            eprint!("\rrestore: {settled} files settled");
        }
        if settled > 0 {
            eprintln!();
        }
    });

    let res = downloader.download(&a.backup, a.snapshot, &filter);
    // Dropping the downloader closes the progress channel.
    drop(downloader);
    if watcher.join().is_err() {
        return Err(SalvageError::Worker("progress printer panicked".into()));
    }
    print_report(&res?);
    Ok(())
}

fn print_report(r: &DownloadReport) {
    eprintln!(
        "restore: snapshot {}: {} ok, {} failed ({} of {} bytes written, {} failed)",
        r.snapshot,
        r.summary.succeeded(),
        r.summary.failed(),
        r.tally.out_bytes,
        r.tally.total_bytes,
        r.tally.failed_bytes
    );
    if r.unverified_chunks > 0 {
        eprintln!("  warning: {} chunks had no checksum", r.unverified_chunks);
    }
    for (outcome, n) in &r.summary.counts {
        eprintln!("  {:<20} {n}", format!("{outcome:?}"));
    }
    for (f, outcome) in &r.failed_files {
        eprintln!("  failed: {:?}  {}/{}", outcome, f.domain, f.relative_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const CATALOG: &str = r#"{
        "backups": {
            "dev": {
                "snapshots": [
                    { "id": 2, "committed": true, "files": [
                        { "size": 0, "relative_path": "Documents/empty.txt", "domain": "HomeDomain" }
                    ] }
                ]
            }
        }
    }"#;

    fn args(root: PathBuf, dest: PathBuf) -> RestoreArgs {
        RestoreArgs {
            root,
            backup: "dev".into(),
            dest,
            snapshot: -1,
            config: None,
            threads: Some(1),
            retries: Some(0),
            domains: vec![],
            extensions: vec![],
        }
    }

    #[test]
    fn restore_writes_empty_files() {
        let repo = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("catalog.json"), CATALOG).unwrap();

        handle_restore(args(repo.path().into(), out.path().into())).unwrap();
        let restored = out.path().join("2/HomeDomain/Documents/empty.txt");
        assert_eq!(fs::metadata(restored).unwrap().len(), 0);
    }

    #[test]
    fn restore_rejects_zero_threads() {
        let repo = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        fs::write(repo.path().join("catalog.json"), CATALOG).unwrap();

        let mut a = args(repo.path().into(), out.path().into());
        a.threads = Some(0);
        assert!(handle_restore(a).is_err());
    }

    #[test]
    fn missing_catalog_is_an_error() {
        let repo = tempfile::tempdir().unwrap();
        assert!(handle_snapshots(repo.path().into(), "dev").is_err());
    }
}
