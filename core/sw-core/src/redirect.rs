//! Host canonicalization.
//!
//! Two rules, checked once per page load: a `www.` host goes to the bare
//! domain, and an instructor on someone else's subdomain goes to the apex.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

use crate::error::{Result, SwError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewerRole {
    Instructor,
    Student,
    Admin,
}

/// The signed-in user, as far as redirects care.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub role: ViewerRole,
    #[serde(default)]
    pub subdomain: Option<String>,
}

/// Parses a location, assuming `https://` when no scheme is given.
pub fn parse_location(location: &str) -> Result<Url> {
    let trimmed = location.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    Url::parse(&candidate).map_err(|err| SwError::InvalidUrl {
        url: location.to_string(),
        reason: err.to_string(),
    })
}

pub fn www_redirect(url: &Url) -> Option<Url> {
    let host = url.host_str()?;
    let bare = host.strip_prefix("www.")?;
    if bare.is_empty() {
        return None;
    }
    let mut target = url.clone();
    target.set_host(Some(bare)).ok()?;
    Some(target)
}

pub fn subdomain_redirect(url: &Url, viewer: Option<&Viewer>, apex: &str) -> Option<Url> {
    let viewer = viewer?;
    if viewer.role != ViewerRole::Instructor {
        return None;
    }

    let host = url.host_str()?;
    let label = host.strip_suffix(apex)?.strip_suffix('.')?;
    if label.is_empty() || label.contains('.') {
        return None;
    }
    if viewer.subdomain.as_deref() == Some(label) {
        return None;
    }

    let mut target = Url::parse(&format!("https://{}", apex)).ok()?;
    target.set_path(url.path());
    target.set_query(url.query());
    target.set_fragment(url.fragment());
    Some(target)
}

/// Makes the redirect decision at most once.
#[derive(Debug, Default)]
pub struct RedirectGuard {
    checked: AtomicBool,
}

impl RedirectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, url: &Url, viewer: Option<&Viewer>, apex: &str) -> Option<Url> {
        if self.checked.swap(true, Ordering::SeqCst) {
            return None;
        }
        www_redirect(url).or_else(|| subdomain_redirect(url, viewer, apex))
    }

    pub fn has_checked(&self) -> bool {
        self.checked.load(Ordering::SeqCst)
    }
}
