//! Pre-compiled path patterns for the default route table.
//!
//! Patterns run against the URL path only (never host or query).

use once_cell::sync::Lazy;
use regex::Regex;

pub static RE_AUTH_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(auth|login|logout)").unwrap());
pub static RE_DASHBOARD_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(dashboard|analytics)").unwrap());
pub static RE_COURSE_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/(course|lesson)").unwrap());
pub static RE_PROFILE_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"/profile").unwrap());
pub static RE_API_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/api/").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_pattern_matches_nested_paths() {
        assert!(RE_AUTH_PATH.is_match("/api/auth/refresh"));
        assert!(RE_AUTH_PATH.is_match("/login"));
        assert!(RE_AUTH_PATH.is_match("/api/logout"));
        assert!(!RE_AUTH_PATH.is_match("/api/courses"));
    }

    #[test]
    fn api_pattern_is_anchored() {
        assert!(RE_API_PATH.is_match("/api/students"));
        assert!(!RE_API_PATH.is_match("/v2/api/students"));
    }

    #[test]
    fn course_pattern_covers_plurals() {
        assert!(RE_COURSE_PATH.is_match("/api/courses/12"));
        assert!(RE_COURSE_PATH.is_match("/api/lessons/3/video"));
    }
}
