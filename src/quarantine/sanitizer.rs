//! Deterministic content sanitizer.
//!
//! Pure function: no network, no clock, no randomness. Everything the
//! sender controls is reduced to allow-listed structure plus text, and every
//! URL is captured as data rather than left live.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;

use crate::mail::{AttachmentMeta, RawMail};

/// Elements removed together with everything inside them.
const DANGEROUS_ELEMENTS: &[&str] = &[
    "script", "iframe", "form", "object", "applet", "style", "embed", "svg",
];

/// The only tags that survive, and they survive without attributes.
const ALLOWED_TAGS: &[&str] = &["p", "br", "b", "i", "u", "strong", "em", "ul", "ol", "li"];

/// Tags rendered as a line break in the text body.
const BLOCK_TAGS: &[&str] = &["p", "br", "li", "div", "tr", "h1", "h2", "h3", "h4", "h5", "h6"];

/// A hyperlink pulled out of the message. Never followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedLink {
    pub href: String,
    pub text: String,
}

/// Sanitizer output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanitizedContent {
    pub body_text: String,
    pub body_html: String,
    pub links: Vec<ExtractedLink>,
    pub images: Vec<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub tracking_pixels: usize,
}

impl SanitizedContent {
    /// The part of the result kept in the message's metadata column.
    pub fn to_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "links": self.links,
            "images": self.images,
            "attachments": self.attachments,
            "tracking_pixels": self.tracking_pixels,
        })
    }
}

fn element_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?is)<\s*{tag}\b[^>]*>.*?<\s*/\s*{tag}\s*>")).expect("element regex")
}

static DANGEROUS_BLOCKS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| DANGEROUS_ELEMENTS.iter().map(|t| element_regex(t)).collect());

static DANGEROUS_ORPHANS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?is)<\s*/?\s*(?:{})\b[^>]*>?",
        DANGEROUS_ELEMENTS.join("|")
    ))
    .expect("orphan regex")
});

static COMMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?(?:-->|$)").expect("comment regex"));

static EVENT_HANDLERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)[\s/]on[a-z]+\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+)"#).expect("handler regex")
});

static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex"));

static IMAGES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<\s*img\b([^>]*)>").expect("img regex"));

static ANCHORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<\s*a\b([^>]*)>(.*?)<\s*/\s*a\s*>").expect("anchor regex")
});

static TAGS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<\s*(/?)\s*([a-zA-Z][a-zA-Z0-9]*)\b[^>]*>").expect("tag regex"));

/// Anything that still looks like markup once entities are decoded,
/// including a tag left unterminated at end of input.
static TAG_RESIDUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)</?[a-zA-Z!?][^>]*(?:>|$)").expect("residue regex"));

static ENTITIES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[xX][0-9a-fA-F]{1,6}|#[0-9]{1,7}|[a-zA-Z]{2,8});").expect("entity regex")
});

/// Scheme names with arbitrary whitespace or control characters between letters.
fn obfuscated_scheme(word: &str) -> String {
    let gap = r"[\s\x00-\x1f]*";
    let mut pattern = String::from("(?i)");
    for (i, ch) in word.chars().enumerate() {
        if i > 0 {
            pattern.push_str(gap);
        }
        pattern.push_str(&regex::escape(&ch.to_string()));
    }
    pattern.push_str(gap);
    pattern.push(':');
    pattern
}

static SCRIPT_SCHEMES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "{}|{}",
        obfuscated_scheme("javascript"),
        obfuscated_scheme("vbscript").trim_start_matches("(?i)")
    ))
    .expect("scheme regex")
});

static DATA_URIS: LazyLock<Regex> = LazyLock::new(|| {
    let scheme = obfuscated_scheme("data");
    Regex::new(&format!(r"{scheme}[\s\x00-\x1f]*(?:[\w.+-]+/[\w.+-]+)?[;,]")).expect("data regex")
});

fn attr_regex(name: &str) -> Regex {
    Regex::new(&format!(
        r#"(?is)(?:^|[\s/]){name}\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#
    ))
    .expect("attr regex")
}

static ATTR_SRC: LazyLock<Regex> = LazyLock::new(|| attr_regex("src"));
static ATTR_HREF: LazyLock<Regex> = LazyLock::new(|| attr_regex("href"));
static ATTR_WIDTH: LazyLock<Regex> = LazyLock::new(|| attr_regex("width"));
static ATTR_HEIGHT: LazyLock<Regex> = LazyLock::new(|| attr_regex("height"));

fn attr_value(re: &Regex, attrs: &str) -> Option<String> {
    re.captures(attrs).and_then(|c| {
        c.get(1)
            .or_else(|| c.get(2))
            .or_else(|| c.get(3))
            .map(|m| decode_entities(m.as_str().trim()))
    })
}

fn is_pixel_dimension(value: Option<String>) -> bool {
    value
        .map(|v| {
            let v = v.trim().trim_end_matches("px");
            v == "0" || v == "1"
        })
        .unwrap_or(false)
}

/// Decode named and numeric character references, once.
pub fn decode_entities(input: &str) -> String {
    ENTITIES
        .replace_all(input, |caps: &Captures| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16)
                    .ok()
                    .map(|n| char::from_u32(n).unwrap_or('\u{FFFD}'))
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>()
                    .ok()
                    .map(|n| char::from_u32(n).unwrap_or('\u{FFFD}'))
            } else {
                match body.to_ascii_lowercase().as_str() {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    _ => None,
                }
            };
            match decoded {
                Some('\0') => String::new(),
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Rewrite script-capable URI schemes to `blocked:`.
pub fn neutralize_uris(input: &str) -> String {
    let step = SCRIPT_SCHEMES.replace_all(input, "blocked:");
    DATA_URIS.replace_all(&step, "blocked:").into_owned()
}

/// Repeat `neutralize_uris` until nothing changes. Joining segments around a
/// stripped tag can assemble a scheme neither segment held alone.
fn neutralize_assembled(mut input: String) -> String {
    loop {
        let next = neutralize_uris(&input);
        if next == input {
            return input;
        }
        input = next;
    }
}

fn strip_control(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t' | '\r'))
        .collect()
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

fn collapse_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Final pass on decoded text: normalize, neutralize, and drop anything
/// that decoding turned back into markup.
fn finish_text(decoded: &str) -> String {
    let normalized: String = strip_control(decoded).nfkc().collect();
    let neutralized = neutralize_uris(&normalized);
    TAG_RESIDUE.replace_all(&neutralized, "").into_owned()
}

/// Remove dangerous elements, comments, and inline handlers.
fn strip_active_content(html: &str) -> String {
    let mut s = COMMENTS.replace_all(html, "").into_owned();
    for re in DANGEROUS_BLOCKS.iter() {
        s = re.replace_all(&s, "").into_owned();
    }
    s = DANGEROUS_ORPHANS.replace_all(&s, "").into_owned();
    // Handlers only count inside a tag; prose like "one = 5" is left alone.
    ANY_TAG
        .replace_all(&s, |caps: &Captures| EVENT_HANDLERS.replace_all(&caps[0], " ").into_owned())
        .into_owned()
}

struct HtmlPass {
    html: String,
    text: String,
    links: Vec<ExtractedLink>,
    images: Vec<String>,
    tracking_pixels: usize,
}

fn sanitize_html(raw: &str) -> HtmlPass {
    let cleaned = strip_active_content(&strip_control(raw));

    let mut images = Vec::new();
    let mut tracking_pixels = 0;
    let cleaned = IMAGES.replace_all(&cleaned, |caps: &Captures| {
        let attrs = &caps[1];
        if is_pixel_dimension(attr_value(&ATTR_WIDTH, attrs))
            || is_pixel_dimension(attr_value(&ATTR_HEIGHT, attrs))
        {
            tracking_pixels += 1;
        } else if let Some(src) = attr_value(&ATTR_SRC, attrs) {
            let lower = src.to_ascii_lowercase();
            if lower.starts_with("http://") || lower.starts_with("https://") {
                images.push(src);
            }
        }
        String::new()
    });

    let mut links = Vec::new();
    let cleaned = ANCHORS.replace_all(&cleaned, |caps: &Captures| {
        let inner = caps[2].to_string();
        if let Some(href) = attr_value(&ATTR_HREF, &caps[1]) {
            let text = finish_text(&decode_entities(&TAGS.replace_all(&inner, " ")));
            links.push(ExtractedLink {
                href: neutralize_uris(&href),
                text: collapse_whitespace(&text),
            });
        }
        inner
    });

    // Tokenize: allow-listed tags are re-emitted bare, text is decoded and escaped.
    let mut html = String::new();
    let mut text = String::new();
    let mut last = 0;
    for caps in TAGS.captures_iter(&cleaned) {
        let Some(whole) = caps.get(0) else { continue };
        let segment = finish_text(&decode_entities(&cleaned[last..whole.start()]));
        html.push_str(&escape_html(&segment));
        text.push_str(&segment);
        last = whole.end();

        let closing = !caps[1].is_empty();
        let tag = caps[2].to_ascii_lowercase();
        if ALLOWED_TAGS.contains(&tag.as_str()) {
            match (tag.as_str(), closing) {
                ("br", _) => html.push_str("<br>"),
                (t, true) => html.push_str(&format!("</{t}>")),
                (t, false) => html.push_str(&format!("<{t}>")),
            }
        }
        if BLOCK_TAGS.contains(&tag.as_str()) {
            text.push('\n');
        } else {
            text.push(' ');
        }
    }
    let tail = finish_text(&decode_entities(&cleaned[last..]));
    html.push_str(&escape_html(&tail));
    text.push_str(&tail);

    HtmlPass {
        html: neutralize_assembled(html.trim().to_string()),
        text: neutralize_assembled(collapse_whitespace(&text)),
        links,
        images,
        tracking_pixels,
    }
}

/// Sanitize an untrusted message.
pub fn sanitize(mail: &RawMail) -> SanitizedContent {
    let html_pass = mail.html_body.as_deref().map(sanitize_html);

    let body_text = match mail.text_body.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(plain) => collapse_whitespace(&finish_text(plain)),
        None => html_pass
            .as_ref()
            .map(|p| p.text.clone())
            .unwrap_or_default(),
    };

    let (body_html, links, images, tracking_pixels) = match html_pass {
        Some(p) => (p.html, p.links, p.images, p.tracking_pixels),
        None => (String::new(), Vec::new(), Vec::new(), 0),
    };

    SanitizedContent {
        body_text,
        body_html,
        links,
        images,
        attachments: mail.attachments.clone(),
        tracking_pixels,
    }
}
