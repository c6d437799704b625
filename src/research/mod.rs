//! Sender domain research: SSRF-guarded homepage lookups behind a cache.

pub mod researcher;
pub mod ssrf;

pub use researcher::{
    DomainResearcher, HttpFetcher, PageFacts, PageFetcher, Resolver, SSRF_BLOCKED_MARKER,
    SystemResolver, parse_page,
};
pub use ssrf::{check_resolved, is_forbidden_ip};
