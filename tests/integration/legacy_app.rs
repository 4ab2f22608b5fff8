//! A PHP 5 era application run on PHP 8: errors captured from a rendered
//! page (entity-escaped, as copied from a page-source view) are fed back
//! through the whole pipeline with rules loaded from a `rules/` directory.

use php_patcher::apply::{backup_path, PatchApplier, PatchMethod};
use php_patcher::config::discover_with;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Where the application lived on the server that produced the errors.
const SERVER_ROOT: &str = "/home/www-virtual/shop";

fn setup_mock_app() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    fs::create_dir_all(root.join("lib")).unwrap();
    fs::create_dir_all(root.join("templates")).unwrap();
    fs::create_dir_all(root.join("rules")).unwrap();

    fs::write(
        root.join("lib/cart.php"),
        r#"<?php
/**
 * Shopping cart.
 */
class Cart
{
    var $items;

    /**
     * Add a line.
     */
    function add($sku, $qty)
    {
        $this->items[$sku] = $qty;
        $this->total = $this->total + $qty;
        $this->lastSku = $sku;
    }

    function describe()
    {
        return "Cart with $this->count items"; // $this->note
    }
}
"#,
    )
    .unwrap();

    fs::write(
        root.join("templates/list.tpl.php"),
        "<?php foreach ($rows as $row) { ?>\n<li><?php echo $row['label']; ?></li>\n<?php } ?>\n",
    )
    .unwrap();

    fs::write(
        root.join("lib/util.php"),
        "<?php\nfunction first_word($s)\n{\n    $parts = split(' ', $s);\n    return $parts[0];\n}\n",
    )
    .unwrap();

    fs::write(
        root.join("rules/10-removed-functions.toml"),
        r#"
[[rules]]
id = "split-to-explode"
search = '\bsplit\('
replace = "explode("
note = "split() was removed in PHP 7"
match = "Call to undefined function split"

[[path_maps]]
from = "/home/www-virtual/shop"
to = "."
"#,
    )
    .unwrap();

    dir
}

fn page_source() -> String {
    [
        format!("&lt;b&gt;Deprecated&lt;/b&gt;:  Creation of dynamic property Cart::$total is deprecated in &lt;b&gt;{SERVER_ROOT}/lib/cart.php&lt;/b&gt; on line &lt;b&gt;15&lt;/b&gt;&lt;br /&gt;"),
        format!("&lt;b&gt;Deprecated&lt;/b&gt;:  Creation of dynamic property Cart::$lastSku is deprecated in &lt;b&gt;{SERVER_ROOT}/lib/cart.php&lt;/b&gt; on line &lt;b&gt;16&lt;/b&gt;&lt;br /&gt;"),
        format!("&lt;b&gt;Warning&lt;/b&gt;:  Undefined array key &quot;label&quot; in &lt;b&gt;{SERVER_ROOT}/templates/list.tpl.php&lt;/b&gt; on line &lt;b&gt;2&lt;/b&gt;&lt;br /&gt;"),
        format!("PHP Fatal error:  Uncaught Error: Call to undefined function split() in {SERVER_ROOT}/lib/util.php on line 4"),
    ]
    .join("\n")
}

#[test]
fn test_full_run_then_idempotent_rerun() {
    let app = setup_mock_app();
    let root = app.path();

    let loaded = discover_with(None, None, root).unwrap();
    assert_eq!(loaded.sources.len(), 1);
    let map = loaded.config.path_map();
    let applier = PatchApplier::new(loaded.config.rules.clone());
    let evidence = page_source();

    let records = applier.fix_evidence(&evidence, root, &map);
    let files: Vec<_> = records
        .iter()
        .map(|r| r.file.strip_prefix(root).unwrap().to_path_buf())
        .collect();
    assert_eq!(
        files,
        vec![
            Path::new("lib/cart.php").to_path_buf(),
            Path::new("templates/list.tpl.php").to_path_buf(),
            Path::new("lib/util.php").to_path_buf(),
        ]
    );
    assert!(records.iter().all(|r| r.changed));

    // Cart: declarations follow the existing `var` style, right after the
    // last declaration, and only for real references.
    let cart = fs::read_to_string(root.join("lib/cart.php")).unwrap();
    assert!(cart.contains("    var $items;\n    var $lastSku;\n    var $total;\n\n    /**"));
    assert!(!cart.contains("$count;"));
    assert!(!cart.contains("$note;"));
    assert_eq!(records[0].method, PatchMethod::Applied(vec![php_patcher::Stage::DynDeclare]));

    let list = fs::read_to_string(root.join("templates/list.tpl.php")).unwrap();
    assert!(list.contains("<li><?php echo ($row['label'] ?? null); ?></li>"));
    assert_eq!(records[1].note, "coalesce:label x1");

    let util = fs::read_to_string(root.join("lib/util.php")).unwrap();
    assert!(util.contains("$parts = explode(' ', $s);"));
    assert_eq!(records[2].method.to_string(), "rules");
    assert_eq!(records[2].note, "split-to-explode x1");

    for record in &records {
        let backup = record.backup.as_ref().unwrap();
        assert_eq!(backup, &backup_path(&record.file));
    }
    let original_util = fs::read_to_string(backup_path(&root.join("lib/util.php"))).unwrap();
    assert!(original_util.contains("split(' ', $s)"));

    // The same page again: nothing left to do, backups untouched.
    let rerun = applier.fix_evidence(&evidence, root, &map);
    assert_eq!(rerun.len(), 3);
    assert!(rerun.iter().all(|r| !r.changed && r.method == PatchMethod::None));
    assert_eq!(
        fs::read_to_string(backup_path(&root.join("lib/util.php"))).unwrap(),
        original_util
    );
}
