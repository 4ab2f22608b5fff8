//! PHP Patcher: error-driven repair of legacy PHP applications
//!
//! Takes the error output a running PHP application produced, works out
//! which source files and lines it points at, and applies the smallest
//! edits that make those errors go away on a modern PHP runtime.
//!
//! # Architecture
//!
//! Every file change goes through one primitive, [`Edit`]: a verified
//! byte-span replacement. The stages differ only in how they find spans:
//!
//! - [`rules`]: ordered regex substitutions from a rule set
//! - [`coalesce`]: `(... ?? null)` around array reads PHP reported as undefined
//! - [`declare`]: property declarations for dynamic properties, placed by
//!   the structural class scanner in [`scan`]
//! - [`fallback`]: a text-completion collaborator, only when nothing else
//!   changed the file
//!
//! [`apply::PatchApplier`] runs the stages per file and owns backup, write,
//! validation and revert.
//!
//! # Safety
//!
//! - A `.bak` copy is made before the first write and never overwritten
//! - Atomic file writes (tempfile + fsync + rename)
//! - Content is re-checked on disk before writing
//! - Files that fail validation are restored byte-for-byte
//! - Structural passes are idempotent
//!
//! # Example
//!
//! ```no_run
//! use php_patcher::{PatchApplier, PathMap};
//! use std::path::Path;
//!
//! let evidence = std::fs::read_to_string("error.html")?;
//! let applier = PatchApplier::new(Vec::new());
//! for record in applier.fix_evidence(&evidence, Path::new("/srv/app"), &PathMap::from_env()) {
//!     println!("{}: {} ({})", record.file.display(), record.method, record.note);
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

/// Define a function returning a lazily compiled, process-wide [`regex::Regex`].
macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| {
                Regex::new($pattern).expect(concat!("valid ", stringify!($name), " regex"))
            })
        }
    };
}

pub mod apply;
pub mod cache;
pub mod coalesce;
pub mod config;
pub mod declare;
pub mod edit;
pub mod fallback;
pub mod jobs;
pub mod locate;
pub mod remap;
pub mod rules;
pub mod scan;
pub mod style;
pub mod validate;

// Re-exports
pub use apply::{FileTarget, FixOptions, PatchApplier, PatchError, PatchMethod, PatchRecord, Stage};
pub use config::{load_from_path, load_from_str, ConfigError, FixerConfig};
pub use declare::DynPropsMode;
pub use edit::{Edit, EditError, EditVerification};
pub use fallback::{Completer, CompletionError, CompletionRequest, HttpCompleter};
pub use jobs::{JobError, JobId, JobStatus, JobStore};
pub use locate::{extract_targets, ErrorTarget};
pub use remap::{PathMap, PathMapping};
pub use rules::Rule;
pub use style::StyleProfile;
pub use validate::{PhpLint, ValidationReport, Validator, ValidatorError};
