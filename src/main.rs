use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use php_patcher::apply::{file_targets, FileTarget, FixOptions, PatchApplier, PatchMethod, PatchRecord};
use php_patcher::config::{discover, LoadedConfig};
use php_patcher::declare::DynPropsMode;
use php_patcher::fallback::HttpCompleter;
use php_patcher::locate::extract_targets;
use php_patcher::remap::PathMap;
use php_patcher::style::StyleProfile;
use php_patcher::validate::PhpLint;
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeSet, HashMap};
use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "php-patcher")]
#[command(about = "Error-driven patch engine for legacy PHP applications", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Source {
    /// File holding captured error output (stdin when omitted or "-")
    evidence: Option<PathBuf>,

    /// Project root that relative paths resolve against (default: current directory)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Rule file (otherwise PHP_PATCHER_CONFIG, ./php-patcher.toml, then ./rules/*.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files and lines named by error output
    Targets {
        #[command(flatten)]
        source: Source,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Patch the files named by error output
    Fix {
        #[command(flatten)]
        source: Source,

        /// What to do about dynamic properties: declare, attribute or off
        #[arg(long, default_value_t)]
        dynprops: DynPropsMode,

        /// Skip `php -l` after writing
        #[arg(long)]
        no_lint: bool,

        /// Ask the completion endpoint when no rule or structural fix applies
        #[arg(long)]
        llm: bool,

        /// Dry run - show what would be changed without modifying files
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Show unified diff of changes
        #[arg(short, long)]
        diff: bool,

        /// Print the patch records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Declare dynamic properties in the given files
    Declare {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// declare, attribute or off
        #[arg(long, default_value_t)]
        mode: DynPropsMode,

        /// Write the changes (otherwise only show the diff)
        #[arg(short, long)]
        write: bool,

        /// Skip `php -l` after writing
        #[arg(long)]
        no_lint: bool,
    },

    /// Show the inferred code style of files
    Profile {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Targets { source, json } => cmd_targets(source, json),

        Commands::Fix {
            source,
            dynprops,
            no_lint,
            llm,
            dry_run,
            diff,
            json,
        } => {
            let options = FixOptions {
                dynprops,
                use_fallback: llm,
                validate: !no_lint,
            };
            cmd_fix(source, options, dry_run, diff, json)
        }

        Commands::Declare {
            files,
            mode,
            write,
            no_lint,
        } => cmd_declare(files, mode, write, no_lint),

        Commands::Profile { files } => cmd_profile(files),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Read evidence from `path`, or stdin for `None` / `-`.
fn read_evidence(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) if path != Path::new("-") => fs::read_to_string(path)
            .with_context(|| format!("failed to read evidence from {}", path.display())),
        _ => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read evidence from stdin")?;
            Ok(buf)
        }
    }
}

/// Evidence, config, path map and root for a command.
fn prepare(source: &Source, quiet: bool) -> Result<(String, LoadedConfig, PathMap, PathBuf)> {
    let cwd = env::current_dir()?;
    let loaded = discover(source.config.as_deref(), &cwd)?;
    if !quiet {
        for path in &loaded.sources {
            eprintln!("{}", format!("Config: {}", path.display()).dimmed());
        }
    }
    let map = loaded.config.path_map_with_env();
    let root = match &source.root {
        Some(root) => root
            .canonicalize()
            .with_context(|| format!("project root {} not found", root.display()))?,
        None => cwd,
    };
    let evidence = read_evidence(source.evidence.as_deref())?;
    Ok((evidence, loaded, map, root))
}

fn cmd_targets(source: Source, json: bool) -> Result<()> {
    let (evidence, _, map, root) = prepare(&source, json)?;
    let targets = extract_targets(&evidence);

    if json {
        let rows: Vec<_> = targets
            .iter()
            .map(|target| {
                let resolved = target.resolve(&root, &map);
                serde_json::json!({
                    "path": target.path,
                    "line": target.line,
                    "resolved": resolved,
                    "exists": resolved.exists(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if targets.is_empty() {
        println!("{}", "No targets found in evidence".yellow());
        return Ok(());
    }

    for target in &targets {
        let resolved = target.resolve(&root, &map);
        let symbol = if resolved.exists() {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("{} {}:{}", symbol, resolved.display(), target.line);
        if resolved != Path::new(&target.path) {
            println!("  {}", format!("reported as {}", target.path).dimmed());
        }
    }
    Ok(())
}

fn build_applier(rules: Vec<php_patcher::Rule>, options: FixOptions) -> Result<PatchApplier> {
    let mut applier = PatchApplier::new(rules)
        .with_options(options)
        .with_validator(Arc::new(PhpLint::from_env()));
    if options.use_fallback {
        let completer =
            HttpCompleter::from_env().context("--llm needs OPENAI_API_KEY to be set")?;
        applier = applier.with_completer(Arc::new(completer));
    }
    Ok(applier)
}

fn cmd_fix(source: Source, options: FixOptions, dry_run: bool, show_diff: bool, json: bool) -> Result<()> {
    let (evidence, loaded, map, root) = prepare(&source, json)?;
    let applier = build_applier(loaded.config.rules, options)?;
    let targets = file_targets(&evidence, &root, &map);

    if !json {
        println!("Root: {}", root.display());
        println!("Rules: {}", applier.rules().len());
        println!();
    }

    let records = if targets.is_empty() {
        vec![PatchRecord::no_targets()]
    } else if dry_run {
        plan_targets(&applier, &targets, &evidence, !json, show_diff && !json)
    } else {
        let before = if show_diff {
            snapshot(&targets)
        } else {
            HashMap::new()
        };
        let records = applier.fix_targets(&targets, &evidence);
        if !json {
            for record in &records {
                print_record(record, false);
                if show_diff && record.changed {
                    if let (Some(original), Ok(after)) =
                        (before.get(&record.file), fs::read_to_string(&record.file))
                    {
                        display_diff(&record.file, original, &after);
                    }
                }
            }
        }
        records
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if targets.is_empty() {
        print_record(&records[0], dry_run);
    }

    finish(&records, json)
}

/// Compute and print what would change, writing nothing.
fn plan_targets(
    applier: &PatchApplier,
    targets: &[FileTarget],
    evidence: &str,
    print: bool,
    diff: bool,
) -> Vec<PatchRecord> {
    targets
        .iter()
        .map(|target| {
            let record = match applier.plan_file(&target.path, &target.lines, evidence) {
                Ok(plan) => {
                    if diff && plan.changed() {
                        display_diff(&target.path, &plan.original, &plan.text);
                    }
                    PatchRecord {
                        file: target.path.clone(),
                        changed: plan.changed(),
                        method: plan.method(),
                        note: plan.note(),
                        backup: None,
                        reverted: false,
                    }
                }
                Err(error) => PatchRecord::skipped(&target.path, error.note()),
            };
            if print {
                print_record(&record, true);
            }
            record
        })
        .collect()
}

fn snapshot(targets: &[FileTarget]) -> HashMap<PathBuf, String> {
    targets
        .iter()
        .filter_map(|t| {
            fs::read_to_string(&t.path)
                .ok()
                .map(|content| (t.path.clone(), content))
        })
        .collect()
}

fn cmd_declare(files: Vec<PathBuf>, mode: DynPropsMode, write: bool, no_lint: bool) -> Result<()> {
    let options = FixOptions {
        dynprops: mode,
        use_fallback: false,
        validate: !no_lint,
    };
    let applier = build_applier(Vec::new(), options)?;

    let mut records = Vec::with_capacity(files.len());
    for file in files {
        if write {
            let record = applier.fix_file(&FileTarget::new(&file, Vec::<u32>::new()), "");
            print_record(&record, false);
            records.push(record);
        } else {
            records.extend(plan_targets(
                &applier,
                &[FileTarget::new(&file, Vec::<u32>::new())],
                "",
                true,
                true,
            ));
        }
    }
    finish(&records, false)
}

fn cmd_profile(files: Vec<PathBuf>) -> Result<()> {
    for file in files {
        let source = fs::read_to_string(&file)
            .with_context(|| format!("failed to read {}", file.display()))?;
        let profile = StyleProfile::infer(&source);
        println!("{}", file.display().to_string().bold());
        for part in profile.to_string().split("; ") {
            println!("  {part}");
        }
    }
    Ok(())
}

fn print_record(record: &PatchRecord, dry_run: bool) {
    let file = if record.file.as_os_str().is_empty() {
        "(no targets)".to_string()
    } else {
        record.file.display().to_string()
    };

    let (symbol, verb) = if record.reverted {
        ("↺".yellow(), "Reverted")
    } else if record.changed && record.is_failure() {
        ("✗".red(), "Restore failed")
    } else if record.changed {
        ("✓".green(), if dry_run { "Would patch" } else { "Patched" })
    } else if record.method == PatchMethod::Skip {
        ("✗".red(), "Skipped")
    } else {
        ("⊙".yellow(), "Unchanged")
    };

    println!("{} {} {} [{}]", symbol, verb, file, record.method);
    if !record.note.is_empty() {
        println!("  {}", record.note.dimmed());
    }
    if let Some(backup) = &record.backup {
        println!("  {}", format!("backup: {}", backup.display()).dimmed());
    }
}

/// Helper: Show unified diff between original and modified content
fn display_diff(file: &Path, original: &str, modified: &str) {
    println!(
        "\n{}",
        format!("--- {} (original)", file.display()).dimmed()
    );
    println!("{}", format!("+++ {} (patched)", file.display()).dimmed());

    let diff = TextDiff::from_lines(original, modified);
    for group in diff.grouped_ops(2) {
        for op in group {
            for change in diff.iter_changes(&op) {
                let sign = match change.tag() {
                    ChangeTag::Delete => format!("-{}", change).red(),
                    ChangeTag::Insert => format!("+{}", change).green(),
                    ChangeTag::Equal => format!(" {}", change).normal(),
                };
                print!("{}", sign);
            }
        }
        println!("{}", "...".dimmed());
    }
}

fn finish(records: &[PatchRecord], json: bool) -> Result<()> {
    let patched = records.iter().filter(|r| r.changed).count();
    let reverted = records.iter().filter(|r| r.reverted).count();
    let failed = records.iter().filter(|r| r.is_failure()).count();
    let unchanged = records.len().saturating_sub(patched + failed);

    if !json {
        let files: BTreeSet<_> = records.iter().map(|r| &r.file).collect();
        println!();
        println!("{}", "Summary:".bold());
        println!("  {} files", files.len());
        println!("  {} patched", format!("{}", patched).green());
        println!("  {} unchanged", format!("{}", unchanged).yellow());
        println!("  {} reverted", format!("{}", reverted).yellow());
        println!("  {} failed", format!("{}", failed).red());
    }

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
