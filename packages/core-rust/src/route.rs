//! Route-name syntax.
//!
//! A route is one or more lower-case tokens joined by dots (`hello.world`,
//! `pojo.happy.case.1`). Tokens use `a-z`, `0-9`, `_` and `-` and start with
//! a letter or digit. Names that look like static assets or reserved device
//! files are rejected.

use std::sync::OnceLock;

use regex::Regex;

/// File names that can never be used as routes.
const RESERVED_FILENAMES: &[&str] = &["thumbs.db"];

/// Extensions reserved for executables and device files.
const RESERVED_EXTENSIONS: &[&str] = &[
    "con", "prn", "aux", "nul", "com", "exe", "bat", "cmd", "dll", "com1", "com2", "com3",
    "com4", "com5", "com6", "com7", "com8", "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5",
    "lpt6", "lpt7", "lpt8", "lpt9",
];

fn route_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9_\-]*(\.[a-z0-9][a-z0-9_\-]*)+$")
            .expect("route pattern is a valid regex")
    })
}

/// Why a route name was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteNameError {
    #[error("route name is empty")]
    Empty,
    #[error("missing dot separator(s), e.g. hello.world")]
    MissingDot,
    #[error("use 0-9, a-z, period, hyphen or underscore characters")]
    InvalidCharacters,
    #[error("reserved extension .{0}")]
    ReservedExtension(String),
    #[error("reserved filename {0}")]
    ReservedFilename(String),
}

/// Checks `route` against the route syntax.
///
/// # Errors
///
/// Returns the first rule the name violates.
pub fn validate_route(route: &str) -> Result<(), RouteNameError> {
    if route.is_empty() {
        return Err(RouteNameError::Empty);
    }
    if !route.contains('.') {
        return Err(RouteNameError::MissingDot);
    }
    if !route_pattern().is_match(route) {
        return Err(RouteNameError::InvalidCharacters);
    }
    if RESERVED_FILENAMES.contains(&route) {
        return Err(RouteNameError::ReservedFilename(route.to_string()));
    }
    if let Some((_, ext)) = route.rsplit_once('.') {
        if RESERVED_EXTENSIONS.contains(&ext) {
            return Err(RouteNameError::ReservedExtension(ext.to_string()));
        }
    }
    Ok(())
}
