//! Two jobs reporting the same broken file, fixed at the same time.

use php_patcher::apply::{backup_path, FileTarget, PatchApplier};
use php_patcher::jobs::{JobStatus, JobStore};
use php_patcher::remap::PathMap;
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const MODEL: &str = "<?php\nclass Model\n{\n    public $id;\n\n    public function fill($row)\n    {\n        $this->name = $row['name'];\n        $this->email = $row['email'];\n    }\n}\n";

fn evidence_for(path: &std::path::Path, line: u32) -> String {
    format!(
        "<br />\n<b>Deprecated</b>:  Creation of dynamic property Model::$name is deprecated in <b>{}</b> on line <b>{line}</b><br />\n",
        path.display()
    )
}

#[test]
fn test_concurrent_jobs_share_one_backup() {
    let dir = TempDir::new().unwrap();
    let model = dir.path().join("model.php");
    fs::write(&model, MODEL).unwrap();

    let store = JobStore::new();
    let applier = PatchApplier::default();

    let first = store.create(dir.path(), 1);
    let second = store.create(dir.path(), 1);
    for (job, line) in [(first, 8), (second, 9)] {
        store.set_status(job, JobStatus::Running).unwrap();
        store
            .record_evidence(job, &evidence_for(&model, line), &PathMap::default())
            .unwrap();
        store.record_page(job, false).unwrap();
    }

    let barrier = Arc::new(Barrier::new(2));
    let workers: Vec<_> = [first, second]
        .into_iter()
        .map(|job| {
            let store = store.clone();
            let applier = applier.clone();
            let barrier = barrier.clone();
            let target = FileTarget::new(&model, [8]);
            thread::spawn(move || {
                barrier.wait();
                let handle = store.spawn_fix(job, vec![target], applier).unwrap();
                let records = handle.join().unwrap();
                store.set_status(job, JobStatus::Done).unwrap();
                records
            })
        })
        .collect();

    let records: Vec<_> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();

    // Exactly one job did the work; the other found nothing left to do.
    assert_eq!(records.len(), 2);
    assert_eq!(records.iter().filter(|r| r.changed).count(), 1);
    assert!(records.iter().all(|r| !r.note.contains("modified_during_patch")));

    let patched = fs::read_to_string(&model).unwrap();
    assert_eq!(patched.matches("public $name;").count(), 1);
    assert_eq!(patched.matches("public $email;").count(), 1);
    assert_eq!(fs::read_to_string(backup_path(&model)).unwrap(), MODEL);

    for job in [first, second] {
        let snapshot = store.get(job).unwrap();
        assert_eq!(snapshot.status, JobStatus::Done);
        assert_eq!(snapshot.fixes.len(), 1);
        assert!(!snapshot.needs_confirmation);
        assert_eq!(snapshot.summary.failed, 1);
    }
}

#[test]
fn test_job_targets_report_existence() {
    let dir = TempDir::new().unwrap();
    let model = dir.path().join("model.php");
    fs::write(&model, MODEL).unwrap();
    let missing = dir.path().join("gone.php");

    let store = JobStore::new();
    let job = store.create(dir.path(), 2);
    store
        .record_evidence(job, &evidence_for(&model, 8), &PathMap::default())
        .unwrap();
    store
        .record_evidence(job, &evidence_for(&missing, 3), &PathMap::default())
        .unwrap();

    let rows = store.targets(job).unwrap();
    let by_file = |path: &std::path::Path| rows.iter().find(|r| r.file == path).unwrap();
    assert!(by_file(&model).exists);
    assert!(!by_file(&missing).exists);

    let context = store.get(job).unwrap().context_text();
    assert!(context.contains("model.php"));
    assert!(context.contains("gone.php"));
}
