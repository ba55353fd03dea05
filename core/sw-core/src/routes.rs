//! Declarative route table.
//!
//! Rules are evaluated in order and the first match wins, so a specific rule
//! (`/dashboard`) must sit above the general one (`/api/*`) it overlaps.

use coachly_sw_protocol::{Destination, FetchRequest, HttpMethod, RequestMode};
use regex::Regex;
use std::time::Duration;

use crate::cache::ExpirationPolicy;
use crate::patterns::{
    RE_API_PATH, RE_AUTH_PATH, RE_COURSE_PATH, RE_DASHBOARD_PATH, RE_PROFILE_PATH,
};
use crate::strategy::{CacheTarget, Strategy};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone)]
pub enum RouteMatcher {
    /// Regex over the URL path.
    Path(Regex),
    Navigation,
    Destinations(Vec<Destination>),
}

impl RouteMatcher {
    fn matches(&self, request: &FetchRequest, path: &str) -> bool {
        match self {
            RouteMatcher::Path(pattern) => pattern.is_match(path),
            RouteMatcher::Navigation => request.mode == RequestMode::Navigate,
            RouteMatcher::Destinations(destinations) => {
                destinations.contains(&request.destination)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    pub name: String,
    pub matcher: RouteMatcher,
    pub strategy: Strategy,
    pub cache: Option<CacheTarget>,
    /// Network-only rules guard every read method; caching rules only GET.
    pub any_method: bool,
}

impl RouteRule {
    pub fn new(
        name: &str,
        matcher: RouteMatcher,
        strategy: Strategy,
        cache: Option<CacheTarget>,
    ) -> Self {
        Self {
            name: name.to_string(),
            matcher,
            strategy,
            cache,
            any_method: false,
        }
    }

    pub fn for_any_method(mut self) -> Self {
        self.any_method = true;
        self
    }

    fn matches(&self, request: &FetchRequest, path: &str) -> bool {
        if !self.any_method && request.method != HttpMethod::Get {
            return false;
        }
        self.matcher.matches(request, path)
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    pub fn new(rules: Vec<RouteRule>) -> Self {
        Self { rules }
    }

    /// The Coachly routing policy.
    ///
    /// | Rule | Strategy | Cache | Bound |
    /// |---|---|---|---|
    /// | `/auth` `/login` `/logout` | network-only | none | n/a |
    /// | navigation | precache shell | precache | n/a |
    /// | script/style | cache-first | static-resources | 60 / 30 d |
    /// | image | cache-first | images | 50 / 60 d |
    /// | `/dashboard` `/analytics` | network-first | dashboard-cache | 50 / 5 min |
    /// | `/course` `/lesson` | stale-while-revalidate | course-content | 100 / 1 h |
    /// | `/profile` | network-first | profile-cache | 50 / 10 min |
    /// | `/api/*` | network-first | api-cache | 100 / 5 min |
    pub fn default_table(network_timeout: Duration, shell_url: &str) -> Self {
        let network_first = Strategy::NetworkFirst {
            timeout: network_timeout,
        };

        Self::new(vec![
            RouteRule::new(
                "auth",
                RouteMatcher::Path(RE_AUTH_PATH.clone()),
                Strategy::NetworkOnly,
                None,
            )
            .for_any_method(),
            RouteRule::new(
                "navigation",
                RouteMatcher::Navigation,
                Strategy::PrecacheShell {
                    url: shell_url.to_string(),
                },
                None,
            ),
            RouteRule::new(
                "static-resources",
                RouteMatcher::Destinations(vec![Destination::Script, Destination::Style]),
                Strategy::CacheFirst,
                Some(CacheTarget::new(
                    "static-resources",
                    ExpirationPolicy::bounded(60, Duration::from_secs(30 * DAY)),
                )),
            ),
            RouteRule::new(
                "images",
                RouteMatcher::Destinations(vec![Destination::Image]),
                Strategy::CacheFirst,
                Some(CacheTarget::new(
                    "images",
                    ExpirationPolicy::bounded(50, Duration::from_secs(60 * DAY)),
                )),
            ),
            RouteRule::new(
                "dashboard",
                RouteMatcher::Path(RE_DASHBOARD_PATH.clone()),
                network_first.clone(),
                Some(CacheTarget::new(
                    "dashboard-cache",
                    ExpirationPolicy::bounded(50, Duration::from_secs(5 * MINUTE)),
                )),
            ),
            RouteRule::new(
                "course-content",
                RouteMatcher::Path(RE_COURSE_PATH.clone()),
                Strategy::StaleWhileRevalidate,
                Some(CacheTarget::new(
                    "course-content",
                    ExpirationPolicy::bounded(100, Duration::from_secs(HOUR)),
                )),
            ),
            RouteRule::new(
                "profile",
                RouteMatcher::Path(RE_PROFILE_PATH.clone()),
                network_first.clone(),
                Some(CacheTarget::new(
                    "profile-cache",
                    ExpirationPolicy::bounded(50, Duration::from_secs(10 * MINUTE)),
                )),
            ),
            RouteRule::new(
                "api",
                RouteMatcher::Path(RE_API_PATH.clone()),
                network_first,
                Some(CacheTarget::new(
                    "api-cache",
                    ExpirationPolicy::bounded(100, Duration::from_secs(5 * MINUTE)),
                )),
            ),
        ])
    }

    pub fn match_request(&self, request: &FetchRequest) -> Option<&RouteRule> {
        let path = request.path();
        self.rules.iter().find(|rule| rule.matches(request, &path))
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn cache_targets(&self) -> impl Iterator<Item = &CacheTarget> {
        self.rules.iter().filter_map(|rule| rule.cache.as_ref())
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.cache_targets()
            .map(|target| target.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::default_table(Duration::from_secs(3), "https://app.coachly.io/index.html")
    }

    fn rule_for(request: &FetchRequest) -> Option<String> {
        table().match_request(request).map(|rule| rule.name.clone())
    }

    #[test]
    fn auth_paths_win_over_every_other_rule() {
        let request = FetchRequest::get("https://app.coachly.io/api/auth/me");
        assert_eq!(rule_for(&request).as_deref(), Some("auth"));

        let navigation =
            FetchRequest::get("https://app.coachly.io/login").with_mode(RequestMode::Navigate);
        assert_eq!(rule_for(&navigation).as_deref(), Some("auth"));

        let head = FetchRequest::new(HttpMethod::Head, "https://app.coachly.io/api/logout");
        assert_eq!(rule_for(&head).as_deref(), Some("auth"));
    }

    #[test]
    fn specific_api_rules_precede_generic_api_rule() {
        let dashboard = FetchRequest::get("https://app.coachly.io/api/instructor/dashboard");
        assert_eq!(rule_for(&dashboard).as_deref(), Some("dashboard"));

        let analytics = FetchRequest::get("https://app.coachly.io/api/analytics/revenue");
        assert_eq!(rule_for(&analytics).as_deref(), Some("dashboard"));

        let course = FetchRequest::get("https://app.coachly.io/api/courses/7/lessons");
        assert_eq!(rule_for(&course).as_deref(), Some("course-content"));

        let profile = FetchRequest::get("https://app.coachly.io/api/profile");
        assert_eq!(rule_for(&profile).as_deref(), Some("profile"));

        let promo = FetchRequest::get("https://app.coachly.io/api/promo-codes");
        assert_eq!(rule_for(&promo).as_deref(), Some("api"));
    }

    #[test]
    fn resource_destinations_route_to_asset_caches() {
        let script = FetchRequest::get("https://app.coachly.io/assets/app.js")
            .with_destination(Destination::Script);
        assert_eq!(rule_for(&script).as_deref(), Some("static-resources"));

        let image = FetchRequest::get("https://cdn.coachly.io/course/cover.png")
            .with_destination(Destination::Image);
        assert_eq!(rule_for(&image).as_deref(), Some("images"));
    }

    #[test]
    fn navigation_serves_shell() {
        let request = FetchRequest::get("https://app.coachly.io/students/42")
            .with_mode(RequestMode::Navigate);
        let rule = table().match_request(&request).cloned().expect("rule");
        assert_eq!(rule.name, "navigation");
        assert!(matches!(rule.strategy, Strategy::PrecacheShell { .. }));
    }

    #[test]
    fn caching_rules_ignore_non_get_reads() {
        let head = FetchRequest::new(HttpMethod::Head, "https://app.coachly.io/api/courses");
        assert_eq!(rule_for(&head), None);
    }

    #[test]
    fn unmatched_requests_have_no_rule() {
        let request = FetchRequest::get("https://app.coachly.io/robots.txt");
        assert_eq!(rule_for(&request), None);
    }

    #[test]
    fn cache_names_cover_bounded_caches() {
        let names = table().cache_names();
        assert_eq!(
            names,
            vec![
                "static-resources",
                "images",
                "dashboard-cache",
                "course-content",
                "profile-cache",
                "api-cache"
            ]
        );
    }
}
