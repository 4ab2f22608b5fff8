//! Scenario tests against small mock applications.

mod concurrent_jobs;
mod legacy_app;
