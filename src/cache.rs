//! Thread-local compiled-regex cache for rule patterns.
//!
//! Rule sets are applied to every file of a run, so each pattern would
//! otherwise be recompiled per file. The cache is capped at 256 entries and
//! cleared wholesale when full.

use regex::{Regex, RegexBuilder};
use std::cell::RefCell;
use std::collections::HashMap;

const MAX_CACHE_ENTRIES: usize = 256;

thread_local! {
    // Key is "<flag>:<pattern>" so the same pattern compiled with and without
    // case folding never collides.
    static REGEX_CACHE: RefCell<HashMap<String, Regex>> = RefCell::new(HashMap::new());
}

/// Get a compiled multi-line pattern from the cache, or compile and cache it.
///
/// Compile failures are returned and not cached.
pub fn get_or_compile_regex(pattern: &str, case_insensitive: bool) -> Result<Regex, regex::Error> {
    let cache_key = format!("{}:{pattern}", if case_insensitive { 'i' } else { '-' });

    REGEX_CACHE.with(|cache| {
        let mut cache = cache.borrow_mut();

        if let Some(re) = cache.get(&cache_key) {
            return Ok(re.clone());
        }

        let compiled = RegexBuilder::new(pattern)
            .multi_line(true)
            .case_insensitive(case_insensitive)
            .build()?;

        if cache.len() >= MAX_CACHE_ENTRIES {
            cache.clear();
        }
        cache.insert(cache_key, compiled.clone());
        Ok(compiled)
    })
}

/// Clear the cache (mainly for testing).
pub fn clear_cache() {
    REGEX_CACHE.with(|cache| cache.borrow_mut().clear());
}

pub fn cache_size() -> usize {
    REGEX_CACHE.with(|cache| cache.borrow().len())
}
