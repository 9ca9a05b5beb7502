//! Vendor identity resolution.
//!
//! Resolution tiers, first success wins:
//!
//! 1. **Exact** -- catalog patterns over sender, address and subject.
//! 2. **Extraction** -- a name from the sender domain or display name.
//! 3. **Fuzzy** -- the extracted name compared against catalog names.

use std::sync::{Arc, LazyLock};

use inflections::case::to_title_case;
use regex::{Regex, RegexBuilder};
use strsim::sorensen_dice;

use crate::config::VendorDefinition;
use crate::error::PipelineError;
use crate::models::{ResolutionMethod, VendorMatch};

pub const FUZZY_THRESHOLD: f64 = 0.4;
pub const EXTRACTED_CONFIDENCE: f64 = 0.3;
pub const DEFAULT_ICON: &str = "generic";

const WEBMAIL_DOMAINS: &[&str] = &[
    "gmail",
    "googlemail",
    "yahoo",
    "outlook",
    "hotmail",
    "live",
    "icloud",
    "me",
    "protonmail",
    "proton",
    "aol",
];

/// Second-level labels that precede a country code (`co.uk`, `com.au`).
const SECOND_LEVEL_LABELS: &[&str] = &["co", "com", "net", "org", "ac"];

/// Words that describe the mailbox rather than the sender.
const SENDER_NOISE: &[&str] = &[
    "noreply",
    "no-reply",
    "donotreply",
    "do-not-reply",
    "billing",
    "team",
    "support",
    "info",
    "notifications",
    "notification",
    "payments",
    "receipts",
    "account",
    "accounts",
    "via",
    "mailer",
];

// (name, icon, patterns). Order matters: earlier entries win exact matches.
const BUILTIN_VENDORS: &[(&str, &str, &[&str])] = &[
    ("Netflix", "netflix", &[r"netflix"]),
    ("Spotify", "spotify", &[r"spotify"]),
    ("Amazon Prime", "amazon-prime", &[r"amazon\s*prime", r"prime\s*video"]),
    ("Audible", "audible", &[r"audible"]),
    ("Disney+ Hotstar", "hotstar", &[r"hotstar"]),
    ("Disney+", "disney-plus", &[r"disney\s*(\+|plus)"]),
    ("Hulu", "hulu", &[r"\bhulu\b"]),
    ("HBO Max", "hbo-max", &[r"hbo\s*max", r"\bmax\.com\b"]),
    ("YouTube Premium", "youtube", &[r"youtube\s*(premium|music)"]),
    (
        "Apple",
        "apple",
        &[r"apple\s*(music|tv|one|arcade)", r"\bicloud\+", r"\bitunes\b", r"\bapple\.com\b"],
    ),
    ("Google One", "google-one", &[r"google\s*one\b", r"google\s*storage"]),
    ("Microsoft 365", "microsoft", &[r"microsoft\s*365", r"office\s*365"]),
    ("Xbox Game Pass", "xbox", &[r"xbox\s*game\s*pass"]),
    ("PlayStation Plus", "playstation", &[r"playstation\s*plus", r"\bps\s*plus\b"]),
    ("Adobe", "adobe", &[r"\badobe\b"]),
    ("Dropbox", "dropbox", &[r"dropbox"]),
    ("GitHub", "github", &[r"github"]),
    ("Notion", "notion", &[r"notion\.so", r"\bnotion\b"]),
    ("Slack", "slack", &[r"\bslack\b"]),
    ("Zoom", "zoom", &[r"\bzoom\.us\b", r"zoom\s*(pro|one|workplace)"]),
    ("OpenAI", "openai", &[r"openai", r"chatgpt"]),
    ("Canva", "canva", &[r"\bcanva\b"]),
    ("Figma", "figma", &[r"\bfigma\b"]),
    ("LinkedIn Premium", "linkedin", &[r"linkedin\s*premium"]),
    ("Paramount+", "paramount-plus", &[r"paramount\s*(\+|plus)"]),
    ("Peacock", "peacock", &[r"peacock(tv)?\b"]),
    ("Crunchyroll", "crunchyroll", &[r"crunchyroll"]),
    ("Twitch", "twitch", &[r"\btwitch\b"]),
    ("NordVPN", "nordvpn", &[r"nord\s*vpn"]),
    ("ExpressVPN", "expressvpn", &[r"express\s*vpn"]),
    ("1Password", "1password", &[r"1password"]),
    ("Grammarly", "grammarly", &[r"grammarly"]),
    ("Duolingo", "duolingo", &[r"duolingo"]),
    ("Headspace", "headspace", &[r"headspace"]),
    ("Calm", "calm", &[r"\bcalm\.com\b", r"calm\s*premium"]),
    ("Patreon", "patreon", &[r"patreon"]),
    ("Medium", "medium", &[r"\bmedium\.com\b", r"medium\s*membership"]),
    ("The New York Times", "nytimes", &[r"nytimes", r"new\s*york\s*times"]),
    ("ZEE5", "zee5", &[r"\bzee5\b"]),
    ("SonyLIV", "sonyliv", &[r"sony\s*liv"]),
    ("JioCinema", "jiocinema", &[r"jio\s*cinema"]),
];

static BUILTIN_CATALOG: LazyLock<Arc<VendorCatalog>> = LazyLock::new(|| {
    let entries = BUILTIN_VENDORS
        .iter()
        .map(|(name, icon, patterns)| VendorEntry {
            name: name.to_string(),
            icon: icon.to_string(),
            patterns: patterns
                .iter()
                .map(|p| compile(p).expect("invalid built-in vendor pattern"))
                .collect(),
        })
        .collect();
    Arc::new(VendorCatalog { entries })
});

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

#[derive(Debug, Clone)]
pub struct VendorEntry {
    pub name: String,
    pub icon: String,
    patterns: Vec<Regex>,
}

impl VendorEntry {
    fn matches(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

/// Flat name -> pattern-set registry. Built once and shared.
#[derive(Debug, Clone)]
pub struct VendorCatalog {
    entries: Vec<VendorEntry>,
}

impl VendorCatalog {
    pub fn builtin() -> Arc<Self> {
        BUILTIN_CATALOG.clone()
    }

    /// Built-in catalog with user definitions checked first.
    pub fn with_definitions(definitions: &[VendorDefinition]) -> Result<Arc<Self>, PipelineError> {
        if definitions.is_empty() {
            return Ok(Self::builtin());
        }

        let mut entries = Vec::with_capacity(definitions.len() + BUILTIN_CATALOG.entries.len());
        for def in definitions {
            let patterns = def
                .patterns
                .iter()
                .map(|p| {
                    compile(p).map_err(|e| {
                        PipelineError::Config(format!("Vendor {} pattern {:?}: {}", def.name, p, e))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            entries.push(VendorEntry {
                name: def.name.clone(),
                icon: def.icon.clone().unwrap_or_else(|| slug(&def.name)),
                patterns,
            });
        }
        entries.extend(BUILTIN_CATALOG.entries.iter().cloned());
        Ok(Arc::new(Self { entries }))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn exact_match(&self, text: &str) -> Option<&VendorEntry> {
        self.entries.iter().find(|e| e.matches(text))
    }

    /// Highest-scoring catalog name; ties go to the earlier entry.
    pub fn best_fuzzy(&self, candidate: &str) -> Option<(&VendorEntry, f64)> {
        let needle = normalize(candidate);
        if needle.is_empty() {
            return None;
        }

        let mut best: Option<(&VendorEntry, f64)> = None;
        for entry in &self.entries {
            let score = sorensen_dice(&needle, &normalize(&entry.name));
            if best.is_none_or(|(_, top)| score > top) {
                best = Some((entry, score));
            }
        }
        best
    }
}

#[derive(Debug, Clone)]
pub struct VendorResolver {
    catalog: Arc<VendorCatalog>,
}

impl Default for VendorResolver {
    fn default() -> Self {
        Self::new(VendorCatalog::builtin())
    }
}

impl VendorResolver {
    pub fn new(catalog: Arc<VendorCatalog>) -> Self {
        Self { catalog }
    }

    /// Returns `None` when nothing matched the catalog and no name could be
    /// extracted from the sender.
    pub fn resolve(&self, sender_name: &str, sender_email: &str, subject: &str) -> Option<VendorMatch> {
        let combined = format!("{} {} {}", sender_name, sender_email, subject);
        if let Some(entry) = self.catalog.exact_match(&combined) {
            return Some(VendorMatch {
                name: entry.name.clone(),
                icon: entry.icon.clone(),
                method: ResolutionMethod::Exact,
                confidence: 1.0,
            });
        }

        let extracted = name_from_domain(sender_email).or_else(|| name_from_display(sender_name))?;

        if let Some((entry, score)) = self.catalog.best_fuzzy(&extracted) {
            if score > FUZZY_THRESHOLD {
                return Some(VendorMatch {
                    name: entry.name.clone(),
                    icon: entry.icon.clone(),
                    method: ResolutionMethod::Fuzzy,
                    confidence: score,
                });
            }
        }

        Some(VendorMatch {
            name: extracted,
            icon: DEFAULT_ICON.to_string(),
            method: ResolutionMethod::Extracted,
            confidence: EXTRACTED_CONFIDENCE,
        })
    }
}

/// Splits `"Netflix <info@netflix.com>"` into display name and address.
pub fn split_sender(sender: &str) -> (String, String) {
    let sender = sender.trim();
    if let (Some(open), Some(close)) = (sender.find('<'), sender.rfind('>')) {
        if open < close {
            let name = sender[..open].trim().trim_matches('"').trim();
            let email = sender[open + 1..close].trim();
            return (name.to_string(), email.to_string());
        }
    }
    if sender.contains('@') && !sender.contains(' ') {
        return (String::new(), sender.to_string());
    }
    (sender.trim_matches('"').trim().to_string(), String::new())
}

fn name_from_domain(email: &str) -> Option<String> {
    let (_, domain) = email.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>').to_lowercase();
    let labels: Vec<&str> = domain.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return None;
    }

    let mut idx = labels.len() - 2;
    if idx > 0 && SECOND_LEVEL_LABELS.contains(&labels[idx]) && labels[labels.len() - 1].len() == 2 {
        idx -= 1;
    }
    let label = labels[idx];
    if WEBMAIL_DOMAINS.contains(&label) {
        return None;
    }

    let spaced = label.replace(['-', '_'], " ");
    let name = to_title_case(spaced.trim());
    (!name.is_empty()).then_some(name)
}

fn name_from_display(sender: &str) -> Option<String> {
    let head = sender.split(['<', '@', '(']).next().unwrap_or_default();
    let words: Vec<&str> = head
        .trim()
        .trim_matches('"')
        .split_whitespace()
        .filter(|w| !SENDER_NOISE.contains(&w.to_lowercase().as_str()))
        .collect();
    let name = words.join(" ");
    let name = name.trim_matches(|c: char| !c.is_alphanumeric() && c != '+');
    name.chars()
        .any(|c| c.is_alphanumeric())
        .then(|| name.to_string())
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn slug(value: &str) -> String {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}
