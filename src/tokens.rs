//! Build-environment token substitution.
//!
//! Text content may contain `${NAME}` placeholders for a fixed set of build
//! variables. Values are looked up through a [`TokenSource`] so callers decide
//! where they come from: [`BuildEnvironment`] reads the process environment,
//! while a plain `HashMap` keeps tests deterministic.
//!
//! ```
//! use email_dispatch::tokens::substitute;
//! use std::collections::HashMap;
//!
//! let env = HashMap::from([("BUILD_ID".to_string(), "42".to_string())]);
//! assert_eq!(substitute("Build #${BUILD_ID}", &env), "Build #42");
//! assert_eq!(substitute("${BUILD_NAME}", &env), "${BUILD_NAME}");
//! ```

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Names that may appear as `${NAME}` placeholders.
pub const KNOWN_TOKENS: [&str; 6] = [
    "BUILD_ID",
    "BUILD_NAME",
    "BUILD_JOB_NAME",
    "BUILD_PIPELINE_NAME",
    "ATC_EXTERNAL_URL",
    "BUILD_TEAM_NAME",
];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("valid regex"));

/// Source of values for token substitution.
pub trait TokenSource: Send + Sync {
    /// Returns the value bound to `name`, or `None` when it is unset.
    fn lookup(&self, name: &str) -> Option<String>;
}

/// Reads token values from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuildEnvironment;

impl TokenSource for BuildEnvironment {
    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl TokenSource for HashMap<String, String> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Replaces every known `${NAME}` placeholder that has a value.
///
/// Unknown placeholders, and known ones whose variable is unset, are left as
/// written.
pub fn substitute(text: &str, tokens: &dyn TokenSource) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures<'_>| {
            let name = &caps[1];
            KNOWN_TOKENS
                .contains(&name)
                .then(|| tokens.lookup(name))
                .flatten()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
