//! End-to-end tests for the patch pipeline
//!
//! Exercises backup, verified write, validation revert, the generative
//! fallback and multi-file evidence against real files in a temp dir.

use php_patcher::apply::{backup_path, FileTarget, FixOptions, PatchApplier, PatchMethod};
use php_patcher::fallback::{CompletionError, CompletionRequest, Completer};
use php_patcher::remap::{PathMap, PathMapping};
use php_patcher::rules::Rule;
use php_patcher::validate::{ValidationReport, Validator, ValidatorError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const ONE_LINE_CLASS: &str = "<?php\nclass Foo { function bar(){ $this->x = 1; } }\n";

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

/// Returns a canned response and counts calls.
struct Canned {
    response: Result<String, fn() -> CompletionError>,
    calls: AtomicUsize,
}

impl Canned {
    fn ok(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: Ok(response.to_string()),
            calls: AtomicUsize::new(0),
        })
    }

    fn err(make: fn() -> CompletionError) -> Arc<Self> {
        Arc::new(Self {
            response: Err(make),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Completer for Canned {
    fn complete(&self, _: &CompletionRequest) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(text) => Ok(text.clone()),
            Err(make) => Err(make()),
        }
    }
}

struct Panics;

impl Completer for Panics {
    fn complete(&self, _: &CompletionRequest) -> Result<String, CompletionError> {
        panic!("completer blew up");
    }
}

/// Rewrites the file behind the applier's back while "thinking".
struct Meddles(PathBuf);

impl Completer for Meddles {
    fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        fs::write(&self.0, "<?php\n// someone else was here\n").unwrap();
        Ok(format!("{}// patched\n", request.original_content))
    }
}

/// Rejects any file containing `needle`.
struct RejectsContaining(&'static str);

impl Validator for RejectsContaining {
    fn validate(&self, path: &Path) -> Result<ValidationReport, ValidatorError> {
        let text = fs::read_to_string(path)?;
        if text.contains(self.0) {
            Ok(ValidationReport::fail(format!(
                "PHP Parse error: unexpected '{}' in {} on line 2",
                self.0,
                path.display()
            )))
        } else {
            Ok(ValidationReport::pass())
        }
    }
}

fn with_fallback(completer: Arc<dyn Completer>) -> PatchApplier {
    PatchApplier::default()
        .with_options(FixOptions {
            use_fallback: true,
            ..FixOptions::default()
        })
        .with_completer(completer)
}

#[test]
fn test_one_line_class_gets_single_declaration() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "foo.php", ONE_LINE_CLASS);

    let record = PatchApplier::default().fix_file(&FileTarget::new(&path, [2]), "");
    assert!(record.changed);
    assert_eq!(record.method, PatchMethod::Applied(vec![php_patcher::Stage::DynDeclare]));
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "<?php\nclass Foo {\n    public $x;\n function bar(){ $this->x = 1; } }\n"
    );

    // Nothing left to declare.
    let again = PatchApplier::default().fix_file(&FileTarget::new(&path, [2]), "");
    assert!(!again.changed);
    assert_eq!(again.method, PatchMethod::None);
}

#[test]
fn test_backup_reflects_pre_run_state_and_is_never_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "foo.php", ONE_LINE_CLASS);
    let bak = backup_path(&path);
    let applier = PatchApplier::default();

    let first = applier.fix_file(&FileTarget::new(&path, [2]), "");
    assert!(first.changed);
    assert_eq!(first.backup.as_deref(), Some(bak.as_path()));
    assert_eq!(fs::read_to_string(&bak).unwrap(), ONE_LINE_CLASS);

    // A later edit introduces another dynamic property; the second run
    // changes the file again but leaves the backup alone.
    let current = fs::read_to_string(&path).unwrap();
    fs::write(&path, current.replace("$this->x = 1;", "$this->x = 1; $this->y = 2;")).unwrap();
    let second = applier.fix_file(&FileTarget::new(&path, [2]), "");
    assert!(second.changed);
    assert!(fs::read_to_string(&path).unwrap().contains("public $y;"));
    assert_eq!(fs::read_to_string(&bak).unwrap(), ONE_LINE_CLASS);
}

#[test]
fn test_failed_validation_restores_exact_bytes() {
    let dir = TempDir::new().unwrap();
    let original = "<?php\r\nclass Foo {\r\n\tfunction bar() { $this->x = 1; }\r\n}\r\n";
    let path = write(dir.path(), "crlf.php", original);

    let record = PatchApplier::default()
        .with_validator(Arc::new(RejectsContaining("public $x")))
        .fix_file(&FileTarget::new(&path, [3]), "");

    assert!(record.reverted);
    assert!(!record.changed);
    assert!(record.note.contains("validation_failed:PHP Parse error: unexpected 'public $x'"));
    assert_eq!(fs::read(&path).unwrap(), original.as_bytes());
    // The backup made before the write stays.
    assert_eq!(fs::read(backup_path(&path)).unwrap(), original.as_bytes());
}

#[test]
fn test_passing_validation_keeps_write() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "foo.php", ONE_LINE_CLASS);
    let record = PatchApplier::default()
        .with_validator(Arc::new(RejectsContaining("never present")))
        .fix_file(&FileTarget::new(&path, [2]), "");
    assert!(record.changed);
    assert!(!record.reverted);
    assert_eq!(record.note, "dyn_declare:Foo::$x");
}

#[test]
fn test_fenced_fallback_response_is_accepted() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "view.php", "<?php\necho $title;\n");
    let completer = Canned::ok("Here you go:\n```php\n<?php\necho $title ?? '';\n```\n");

    let record = with_fallback(completer.clone()).fix_file(
        &FileTarget::new(&path, [2]),
        "Warning: Undefined variable $title in /srv/view.php on line 2",
    );
    assert_eq!(completer.calls(), 1);
    assert!(record.changed);
    assert_eq!(record.method.to_string(), "llm");
    assert_eq!(fs::read_to_string(&path).unwrap(), "<?php\necho $title ?? '';\n");
}

#[test]
fn test_identical_fallback_response_is_no_change() {
    let dir = TempDir::new().unwrap();
    let original = "<?php\necho $title;\n";
    let path = write(dir.path(), "view.php", original);

    let record = with_fallback(Canned::ok(original)).fix_file(&FileTarget::new(&path, [2]), "");
    assert!(!record.changed);
    assert_eq!(record.method, PatchMethod::None);
    assert_eq!(record.note, "llm:no_change");
    assert!(!backup_path(&path).exists());
}

#[test]
fn test_failing_fallback_is_reported_not_raised() {
    let dir = TempDir::new().unwrap();
    let original = "<?php\necho $title;\n";
    let path = write(dir.path(), "view.php", original);

    let record = with_fallback(Canned::err(|| CompletionError::Timeout))
        .fix_file(&FileTarget::new(&path, [2]), "");
    assert!(!record.changed);
    assert_eq!(record.note, "llm:error:timeout");

    let record = with_fallback(Arc::new(Panics)).fix_file(&FileTarget::new(&path, [2]), "");
    assert!(!record.changed);
    assert_eq!(record.note, "llm:error:panic");
    assert_eq!(fs::read_to_string(&path).unwrap(), original);
}

#[test]
fn test_fallback_skipped_when_rules_changed_the_file() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "old.php", "<?php\n$parts = split(',', $csv);\n");
    let completer = Canned::ok("<?php\n// should never be used\n");

    let applier = PatchApplier::new(vec![Rule::new("split", r"\bsplit\(", "explode(")])
        .with_options(FixOptions {
            use_fallback: true,
            ..FixOptions::default()
        })
        .with_completer(completer.clone());
    let record = applier.fix_file(&FileTarget::new(&path, [2]), "");

    assert_eq!(completer.calls(), 0);
    assert_eq!(record.method.to_string(), "rules");
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "<?php\n$parts = explode(',', $csv);\n"
    );
}

#[test]
fn test_concurrent_modification_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "race.php", "<?php\necho 1;\n");

    let record = with_fallback(Arc::new(Meddles(path.clone()))).fix_file(&FileTarget::new(&path, [2]), "");
    assert!(!record.changed);
    assert_eq!(record.method, PatchMethod::Skip);
    assert_eq!(record.note, "modified_during_patch");
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "<?php\n// someone else was here\n"
    );
}

#[test]
fn test_evidence_drives_multiple_files_in_order() {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    let model = write(root, "lib/model.php", "<?php\nclass Model {\n    function load() { $this->rows = []; }\n}\n");
    let view = write(root, "view.php", "<?php\necho $row['name'];\n");

    let evidence = format!(
        "<br />\n<b>Warning</b>:  Undefined array key \"name\" in <b>/home/www-virtual/app/view.php</b> on line <b>2</b><br />\n\
         <br />\n<b>Deprecated</b>:  Creation of dynamic property Model::$rows is deprecated in <b>{}</b> on line <b>3</b><br />\n\
         <br />\n<b>Warning</b>:  Undefined array key \"name\" in <b>/home/www-virtual/app/view.php</b> on line <b>2</b><br />\n\
         <br />\n<b>Warning</b>:  include(): Failed opening in <b>/home/www-virtual/app/gone.php</b> on line <b>9</b><br />\n",
        model.display()
    );
    let map = PathMap::new([PathMapping::new("/home/www-virtual/app", root.display().to_string())]);

    let records = PatchApplier::default().fix_evidence(&evidence, Path::new("/unused"), &map);
    assert_eq!(records.len(), 3);

    assert_eq!(records[0].file, view);
    assert_eq!(records[0].method.to_string(), "coalesce");
    assert_eq!(
        fs::read_to_string(&view).unwrap(),
        "<?php\necho ($row['name'] ?? null);\n"
    );

    assert_eq!(records[1].file, model);
    assert_eq!(records[1].method.to_string(), "dyn_declare");

    assert_eq!(records[2].method, PatchMethod::Skip);
    assert_eq!(records[2].note, "not_found");
}

#[test]
fn test_attribute_mode() {
    let dir = TempDir::new().unwrap();
    let path = write(dir.path(), "foo.php", "<?php\n\nclass Foo\n{\n    function bar() { $this->x = 1; }\n}\n");
    let applier = PatchApplier::default().with_options(FixOptions {
        dynprops: php_patcher::DynPropsMode::Attribute,
        ..FixOptions::default()
    });

    let record = applier.fix_file(&FileTarget::new(&path, [5]), "");
    assert_eq!(record.method.to_string(), "dyn_attribute");
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "<?php\n\n#[\\AllowDynamicProperties]\nclass Foo\n{\n    function bar() { $this->x = 1; }\n}\n"
    );

    let again = applier.fix_file(&FileTarget::new(&path, [5]), "");
    assert!(!again.changed);
}

#[test]
fn test_static_and_same_line_forms_patched_as_whole_expressions() {
    let dir = TempDir::new().unwrap();
    let path = write(
        dir.path(),
        "config.php",
        "<?php\nclass Config {\n    public static $cfg = []; public function get($name) {\n        $this->last = $name;\n        return self::$cfg['id'] . $$name['id'];\n    }\n}\n",
    );
    let evidence = format!(
        "Warning: Undefined array key \"id\" in {path} on line 5\n\
         Deprecated: Creation of dynamic property Config::$last is deprecated in {path} on line 4\n",
        path = path.display()
    );

    let records = PatchApplier::default().fix_evidence(&evidence, dir.path(), &PathMap::default());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].method.to_string(), "coalesce+dyn_declare");
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "<?php\nclass Config {\n    public static $cfg = [];\n    public $last;\n public function get($name) {\n        $this->last = $name;\n        return (self::$cfg['id'] ?? null) . ($$name['id'] ?? null);\n    }\n}\n"
    );

    let rerun = PatchApplier::default().fix_evidence(&evidence, dir.path(), &PathMap::default());
    assert!(!rerun[0].changed);
}
