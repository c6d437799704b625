//! Sender domain research with a TTL cache.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use regex::Regex;
use tracing::{debug, info, warn};
use url::{Host, Url};

use crate::error::ResearchError;
use crate::quarantine::sanitizer::decode_entities;
use crate::research::ssrf;
use crate::store::{Database, SenderResearch};

const MAX_TITLE_CHARS: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 500;

/// Marker stored when every fetch was refused by the address guard.
pub const SSRF_BLOCKED_MARKER: &str = "ssrf_blocked";

/// DNS lookup seam.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, ResearchError>;
}

pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, ResearchError> {
        let addrs = tokio::net::lookup_host((domain, 443))
            .await
            .map_err(|e| ResearchError::Resolve {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;
        let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// Fetches a domain's homepage from already-vetted addresses.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// `Ok(None)` means the server answered without a usable page (redirect or error status).
    async fn fetch(&self, domain: &str, addresses: &[IpAddr])
    -> Result<Option<String>, ResearchError>;
}

/// HTTPS homepage fetcher. Never follows redirects, and pins the
/// connection to the addresses that passed the SSRF check.
pub struct HttpFetcher {
    timeout: Duration,
    max_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_page_size_kb: u64) -> Self {
        Self {
            timeout,
            max_bytes: (max_page_size_kb as usize).saturating_mul(1024),
        }
    }

    fn fetch_err(domain: &str, e: impl std::fmt::Display) -> ResearchError {
        ResearchError::Fetch {
            domain: domain.to_string(),
            reason: e.to_string(),
        }
    }

    fn too_large(&self, domain: &str) -> ResearchError {
        ResearchError::TooLarge {
            domain: domain.to_string(),
            limit_kb: (self.max_bytes / 1024) as u64,
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        domain: &str,
        addresses: &[IpAddr],
    ) -> Result<Option<String>, ResearchError> {
        let pinned: Vec<SocketAddr> = addresses.iter().map(|ip| SocketAddr::new(*ip, 443)).collect();
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.timeout)
            .resolve_to_addrs(domain, &pinned)
            .user_agent(concat!("leadflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Self::fetch_err(domain, e))?;

        let mut response = client
            .get(format!("https://{domain}/"))
            .send()
            .await
            .map_err(|e| Self::fetch_err(domain, e))?;

        let status = response.status();
        if status.is_redirection() {
            debug!(domain, %status, "Homepage redirected, not following");
            return Ok(None);
        }
        if !status.is_success() {
            debug!(domain, %status, "Homepage returned non-success status");
            return Ok(None);
        }
        if response
            .content_length()
            .is_some_and(|len| len as usize > self.max_bytes)
        {
            return Err(self.too_large(domain));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Self::fetch_err(domain, e))?
        {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(self.too_large(domain));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(Some(String::from_utf8_lossy(&body).into_owned()))
    }
}

/// What a homepage says about its owner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageFacts {
    pub title: Option<String>,
    pub description: Option<String>,
    pub social_links: BTreeMap<String, String>,
    pub markers: Vec<String>,
}

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());

static META_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<meta\s[^>]*>").unwrap());

static META_NAME_DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:name|property)\s*=\s*["']?(?:og:)?description["']?"#).unwrap()
});

static META_CONTENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)\bcontent\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

static SOCIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)https?://(?:www\.)?(linkedin\.com|instagram\.com|facebook\.com|twitter\.com|x\.com)/[^\s"'<>]+"#,
    )
    .unwrap()
});

static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']tel:|\(?\+?\d{1,3}\)?[\s.-]?\(?\d{3}\)?[\s.-]\d{3}[\s.-]\d{4}"#)
        .unwrap()
});

static ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)<address\b|\b\d{1,5}\s+(?:[A-Za-z]+\s+){1,4}(?:street|st\.|avenue|ave\.?|road|rd\.|boulevard|blvd\.?|lane|ln\.|drive|dr\.|suite)\b",
    )
    .unwrap()
});

static SECTION_LINKS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["'][^"']*/(about|contact|services|work|portfolio|team)\b"#)
        .unwrap()
});

fn clean_text(raw: &str, max_chars: usize) -> Option<String> {
    let decoded = decode_entities(raw);
    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(max_chars).collect())
}

fn platform_of(host: &str) -> &'static str {
    match host.to_lowercase().as_str() {
        "linkedin.com" => "linkedin",
        "instagram.com" => "instagram",
        "facebook.com" => "facebook",
        _ => "twitter",
    }
}

/// Extract title, description, social links, and credibility markers.
pub fn parse_page(html: &str) -> PageFacts {
    let title = TITLE
        .captures(html)
        .and_then(|c| c.get(1))
        .and_then(|m| clean_text(m.as_str(), MAX_TITLE_CHARS));

    let description = META_TAG
        .find_iter(html)
        .filter(|tag| META_NAME_DESCRIPTION.is_match(tag.as_str()))
        .find_map(|tag| {
            let caps = META_CONTENT.captures(tag.as_str())?;
            let value = caps.get(1).or_else(|| caps.get(2))?;
            clean_text(value.as_str(), MAX_DESCRIPTION_CHARS)
        });

    let mut social_links = BTreeMap::new();
    for caps in SOCIAL.captures_iter(html) {
        let platform = platform_of(&caps[1]);
        social_links
            .entry(platform.to_string())
            .or_insert_with(|| caps[0].to_string());
    }

    let mut markers: Vec<String> = social_links
        .keys()
        .map(|platform| format!("{platform}_present"))
        .collect();
    if PHONE.is_match(html) {
        markers.push("phone_listed".into());
    }
    if ADDRESS.is_match(html) {
        markers.push("address_listed".into());
    }
    let mut sections: Vec<String> = SECTION_LINKS
        .captures_iter(html)
        .map(|c| c[1].to_lowercase())
        .collect();
    sections.sort();
    sections.dedup();
    if sections.len() >= 2 {
        markers.push("professional_structure".into());
    }

    PageFacts {
        title,
        description,
        social_links,
        markers,
    }
}

/// Host part of `domain` after validation, as either a name or a literal address.
enum Target {
    Name(String),
    Literal(IpAddr),
}

fn parse_target(domain: &str) -> Result<Target, ResearchError> {
    let invalid = || ResearchError::InvalidDomain(domain.to_string());
    let trimmed = domain.trim();
    if trimmed.is_empty()
        || (trimmed.contains(['/', '@', ':', '?', '#']) && !trimmed.starts_with('['))
    {
        return Err(invalid());
    }
    let url = Url::parse(&format!("https://{trimmed}/")).map_err(|_| invalid())?;
    if url.port().is_some() || !url.username().is_empty() || url.path() != "/" {
        return Err(invalid());
    }
    match url.host() {
        Some(Host::Domain(d)) if d.contains('.') => Ok(Target::Name(d.to_string())),
        Some(Host::Ipv4(ip)) => Ok(Target::Literal(IpAddr::V4(ip))),
        Some(Host::Ipv6(ip)) => Ok(Target::Literal(IpAddr::V6(ip))),
        _ => Err(invalid()),
    }
}

/// Looks up sender domains, at most once per cache window.
pub struct DomainResearcher {
    db: Arc<dyn Database>,
    resolver: Arc<dyn Resolver>,
    fetcher: Arc<dyn PageFetcher>,
    cache_days: i64,
}

impl DomainResearcher {
    pub fn new(
        db: Arc<dyn Database>,
        resolver: Arc<dyn Resolver>,
        fetcher: Arc<dyn PageFetcher>,
        cache_days: i64,
    ) -> Self {
        Self {
            db,
            resolver,
            fetcher,
            cache_days,
        }
    }

    pub async fn research(&self, domain: &str) -> Result<SenderResearch, ResearchError> {
        let domain = domain.trim().to_lowercase();
        let target = parse_target(&domain)?;

        if let Some(cached) = self.db.get_research(&domain).await? {
            let age = Utc::now() - cached.researched_at;
            // A day count too large for TimeDelta never expires.
            let ttl = TimeDelta::try_days(self.cache_days).unwrap_or(TimeDelta::MAX);
            if age < ttl {
                debug!(domain = %domain, age_hours = age.num_hours(), "Research cache hit");
                return Ok(cached);
            }
        }

        let mut research = SenderResearch {
            domain: domain.clone(),
            domain_resolves: false,
            website_title: None,
            website_description: None,
            credibility_markers: Vec::new(),
            social_links: BTreeMap::new(),
            researched_at: Utc::now(),
        };

        let (host, addresses) = match target {
            Target::Literal(ip) => (domain.trim_matches(['[', ']']).to_string(), vec![ip]),
            Target::Name(name) => match self.resolver.resolve(&name).await {
                Ok(addrs) if !addrs.is_empty() => (name, addrs),
                Ok(_) | Err(_) => {
                    info!(domain = %domain, "Domain does not resolve");
                    self.db.upsert_research(&research).await?;
                    return Ok(research);
                }
            },
        };
        research.domain_resolves = true;

        if let Err(e) = ssrf::check_resolved(&domain, &addresses) {
            warn!(domain = %domain, error = %e, "Research blocked by address guard");
            research.credibility_markers.push(SSRF_BLOCKED_MARKER.into());
            self.db.upsert_research(&research).await?;
            return Ok(research);
        }

        match self.fetcher.fetch(&host, &addresses).await {
            Ok(Some(html)) => {
                let facts = parse_page(&html);
                research.website_title = facts.title;
                research.website_description = facts.description;
                research.social_links = facts.social_links;
                research.credibility_markers = facts.markers;
            }
            Ok(None) => debug!(domain = %domain, "No usable homepage"),
            Err(e) => warn!(domain = %domain, error = %e, "Homepage fetch failed"),
        }

        self.db.upsert_research(&research).await?;
        info!(
            domain = %domain,
            markers = research.credibility_markers.len(),
            "Domain research complete"
        );
        Ok(research)
    }
}
