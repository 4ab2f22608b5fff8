//! Integration tests for rule and path-map configuration
//!
//! Covers parsing, validation, directory merging, lookup order, and rules
//! loaded from disk driving a real patch run.

use php_patcher::apply::{FileTarget, PatchApplier};
use php_patcher::config::{
    discover_with, load_dir, load_from_path, load_from_str, ConfigError, FixerConfig,
    ValidationIssue, DEFAULT_CONFIG_FILE, DEFAULT_RULES_DIR,
};
use php_patcher::rules::Rule;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RULES: &str = r#"
[[rules]]
id = "each-to-foreach"
search = 'while\s*\(\s*list\(\s*(\$\w+)\s*,\s*(\$\w+)\s*\)\s*=\s*each\(\s*(\$\w+)\s*\)\s*\)'
replace = 'foreach (\3 as \1 => \2)'
note = "each() was removed in PHP 8"

[[rules]]
id = "ereg"
search = '\bereg\('
replace = "preg_match("
match = "Call to undefined function ereg"
case_insensitive = true

[[path_maps]]
from = "/home/www-virtual/app"
to = "/srv/app"
"#;

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_rules_and_maps() {
    let config = load_from_str(RULES).unwrap();
    assert_eq!(config.rules.len(), 2);

    let each = &config.rules[0];
    assert_eq!(each.id, "each-to-foreach");
    assert_eq!(each.replace, r"foreach (\3 as \1 => \2)");
    assert_eq!(each.match_evidence, None);
    assert!(!each.case_insensitive);

    let ereg = &config.rules[1];
    assert_eq!(
        ereg.match_evidence.as_deref(),
        Some("Call to undefined function ereg")
    );
    assert!(ereg.case_insensitive);
    assert_eq!(ereg.note, "");

    let map = config.path_map();
    assert_eq!(
        map.remap("/home/www-virtual/app/index.php"),
        PathBuf::from("/srv/app/index.php")
    );
}

#[test]
fn test_empty_file_is_empty_config() {
    let config = load_from_str("").unwrap();
    assert!(config.is_empty());
}

#[test]
fn test_toml_round_trip() {
    let config = load_from_str(RULES).unwrap();
    let rendered = toml_edit::ser::to_string(&config).unwrap();
    let reparsed = load_from_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}

#[test]
fn test_validation_issues_are_listed() {
    let toml = r#"
[[rules]]
id = "dup"
search = "a"

[[rules]]
id = "dup"
search = ""

[[path_maps]]
from = "/x"
to = ""
"#;
    let err = load_from_str(toml).unwrap_err();
    let ConfigError::Validation { path: None, source } = &err else {
        panic!("expected validation error, got {err}");
    };
    assert_eq!(
        source.issues,
        vec![
            ValidationIssue::MissingField {
                rule_id: Some("dup".into()),
                field: "search"
            },
            ValidationIssue::DuplicateRuleId {
                rule_id: "dup".into()
            },
            ValidationIssue::EmptyPathMapping { index: 0, field: "to" },
        ]
    );
    let message = err.to_string();
    assert!(message.starts_with("invalid fixer config: "));
    assert!(message.contains("rule id 'dup' is used more than once"));
}

#[test]
fn test_errors_carry_the_file_path() {
    let dir = TempDir::new().unwrap();
    let bad = write(dir.path(), "bad.toml", "[[rules]]\nid = ");
    let err = load_from_path(&bad).unwrap_err();
    assert!(matches!(err, ConfigError::Toml { path: Some(ref p), .. } if p == &bad));
    assert!(err.to_string().contains("failed to parse fixer config TOML"));

    let missing = dir.path().join("missing.toml");
    let err = load_from_path(&missing).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
    assert!(err.to_string().starts_with("failed to read fixer config from"));
}

#[test]
fn test_rule_dir_merges_in_name_order() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "20-late.toml", "[[rules]]\nid = \"late\"\nsearch = \"b\"\n");
    write(dir.path(), "10-early.toml", "[[rules]]\nid = \"early\"\nsearch = \"a\"\n");
    write(dir.path(), "notes.txt", "not a rule file");

    let (config, files) = load_dir(dir.path()).unwrap();
    let ids: Vec<_> = config.rules.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["early", "late"]);
    assert_eq!(files.len(), 2);
}

#[test]
fn test_duplicate_ids_across_files_rejected() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.toml", "[[rules]]\nid = \"x\"\nsearch = \"a\"\n");
    write(dir.path(), "b.toml", "[[rules]]\nid = \"x\"\nsearch = \"b\"\n");
    let err = load_dir(dir.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Validation { path: Some(_), .. }));
}

#[test]
fn test_lookup_order() {
    let dir = TempDir::new().unwrap();
    let base = dir.path();

    let loaded = discover_with(None, None, base).unwrap();
    assert!(loaded.sources.is_empty());
    assert!(loaded.config.is_empty());

    write(base, &format!("{DEFAULT_RULES_DIR}/a.toml"), "[[rules]]\nid = \"dir\"\nsearch = \"a\"\n");
    let loaded = discover_with(None, None, base).unwrap();
    assert_eq!(loaded.config.rules[0].id, "dir");

    write(base, DEFAULT_CONFIG_FILE, "[[rules]]\nid = \"file\"\nsearch = \"a\"\n");
    let loaded = discover_with(None, None, base).unwrap();
    assert_eq!(loaded.config.rules[0].id, "file");

    let from_env = write(base, "env.toml", "[[rules]]\nid = \"env\"\nsearch = \"a\"\n");
    let loaded = discover_with(None, Some(&from_env), base).unwrap();
    assert_eq!(loaded.config.rules[0].id, "env");

    let explicit = write(base, "explicit.toml", "[[rules]]\nid = \"explicit\"\nsearch = \"a\"\n");
    let loaded = discover_with(Some(&explicit), Some(&from_env), base).unwrap();
    assert_eq!(loaded.config.rules[0].id, "explicit");
    assert_eq!(loaded.sources, vec![explicit]);
}

#[test]
fn test_loaded_rules_drive_a_patch() {
    let dir = TempDir::new().unwrap();
    let config_path = write(dir.path(), "rules.toml", RULES);
    let php = write(
        dir.path(),
        "legacy.php",
        "<?php\nwhile (list($k, $v) = each($items)) {\n    echo $k;\n}\nif (EREG('^a', $s)) {}\n",
    );

    let config = load_from_path(&config_path).unwrap();
    let applier = PatchApplier::new(config.rules);
    let record = applier.fix_file(
        &FileTarget::new(&php, [2]),
        "Fatal error: Uncaught Error: Call to undefined function ereg()",
    );

    assert!(record.changed);
    assert_eq!(record.method.to_string(), "rules");
    assert_eq!(record.note, "each-to-foreach x1 ; ereg x1");
    let patched = fs::read_to_string(&php).unwrap();
    assert!(patched.contains("foreach ($items as $k => $v) {"));
    assert!(patched.contains("preg_match('^a', $s)"));
}

#[test]
fn test_gated_rule_skipped_without_matching_evidence() {
    let config = FixerConfig {
        rules: vec![Rule::new("ereg", r"\bereg\(", "preg_match(").matching("undefined function ereg")],
        path_maps: Vec::new(),
    };
    let dir = TempDir::new().unwrap();
    let php = write(dir.path(), "a.php", "<?php\nereg('x', $s);\n");
    let record = PatchApplier::new(config.rules).fix_file(&FileTarget::new(&php, [2]), "Warning: something else");
    assert!(!record.changed);
    assert_eq!(record.note, "no_change");
}
