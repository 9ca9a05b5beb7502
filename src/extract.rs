//! Turns raw message text into a [`ParsedSignal`].
//!
//! Pure and deterministic: no network or database access.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::{Regex, RegexBuilder};

use crate::error::PipelineError;
use crate::models::{BillingCycle, ParsedSignal, RawMessage, TransactionType};
use crate::vendor::{VendorResolver, split_sender};

pub const VENDOR_WEIGHT: u8 = 40;
pub const BILLING_CYCLE_WEIGHT: u8 = 30;
pub const AMOUNT_WEIGHT: u8 = 30;

/// Exclusive bounds for a believable recurring charge.
const MIN_AMOUNT: f64 = 0.0;
const MAX_AMOUNT: f64 = 10_000.0;

/// Bare `$` amounts are taken as US dollars.
const DEFAULT_CURRENCY: &str = "USD";

const NUMBER: &str = r"(\d+(?:,\d{3})*(?:\.\d{1,2})?)";

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .expect("invalid extractor pattern")
}

// Priority order: monthly, yearly, weekly.
static BILLING_CYCLES: LazyLock<Vec<(BillingCycle, Regex)>> = LazyLock::new(|| {
    vec![
        (
            BillingCycle::Monthly,
            ci(r"\bmonthly\b|\bper month\b|\bevery month\b|\ba month\b|/\s?mo(nth)?\b|\bmonth-to-month\b"),
        ),
        (
            BillingCycle::Yearly,
            ci(r"\b(yearly|annual|annually)\b|\bper year\b|\bevery year\b|\ba year\b|/\s?y(ea)?r\b|\b12 months\b"),
        ),
        (
            BillingCycle::Weekly,
            ci(r"\bweekly\b|\bper week\b|\bevery week\b|/\s?w(ee)?k\b"),
        ),
    ]
});

static TRANSACTION_TYPES: LazyLock<Vec<(TransactionType, Regex)>> = LazyLock::new(|| {
    vec![
        (TransactionType::Renewal, ci(r"\brenew(al|als|ed|s|ing)?\b|\bauto-?renew")),
        (TransactionType::Payment, ci(r"\bpayments?\b|\bpaid\b|\bcharged?\b|\bbilled\b")),
        (TransactionType::Invoice, ci(r"\binvoices?\b|\breceipts?\b|\bbilling statement\b")),
        (TransactionType::Subscription, ci(r"\bsubscri(be|bed|ption|ptions)\b|\bmembership\b|\bplan\b")),
        (TransactionType::Trial, ci(r"\bfree trial\b|\btrial\b")),
        (TransactionType::Cancelled, ci(r"\bcancell?(ed|ation)\b|\bunsubscribed\b")),
    ]
});

// Symbol-prefixed and code-suffixed forms, tried in this order.
static AMOUNT_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        (DEFAULT_CURRENCY, ci(&format!(r"(?:US)?\$\s?{}", NUMBER))),
        ("USD", ci(&format!(r"{}\s?USD\b", NUMBER))),
        ("INR", ci(&format!(r"(?:₹|\bRs\.?)\s?{}", NUMBER))),
        ("INR", ci(&format!(r"{}\s?INR\b", NUMBER))),
        ("EUR", ci(&format!(r"€\s?{}", NUMBER))),
        ("EUR", ci(&format!(r"{}\s?(?:EUR\b|€)", NUMBER))),
        ("GBP", ci(&format!(r"£\s?{}", NUMBER))),
        ("GBP", ci(&format!(r"{}\s?GBP\b", NUMBER))),
    ]
});

static RENEWAL_DATE: LazyLock<Regex> = LazyLock::new(|| {
    ci(concat!(
        r"(?:renews?|renewal date|next (?:billing|payment|charge)(?: date)?|will be (?:charged|billed))",
        r"\s*(?:on|:)?\s*",
        r"(\d{4}-\d{2}-\d{2}|[a-z]{3,9}\.? \d{1,2},? \d{4}|\d{1,2} [a-z]{3,9},? \d{4})",
    ))
});

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%B %d %Y", "%b %d %Y", "%d %B %Y", "%d %b %Y"];

#[derive(Debug, Clone, Default)]
pub struct SignalExtractor {
    resolver: VendorResolver,
}

impl SignalExtractor {
    pub fn new(resolver: VendorResolver) -> Self {
        Self { resolver }
    }

    /// Never fails: a message that cannot be parsed comes back with
    /// `parsed = false` and the error recorded.
    pub fn parse(&self, message: &RawMessage) -> ParsedSignal {
        match self.try_parse(message) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!("Message {} not parsed: {}", message.id, e);
                ParsedSignal {
                    message_id: message.id.clone(),
                    parsed: false,
                    error: Some(e.to_string()),
                    vendor: None,
                    raw_vendor: message.from_address.clone().unwrap_or_default(),
                    billing_cycle: BillingCycle::Unknown,
                    transaction_types: vec![TransactionType::Unknown],
                    amount: None,
                    currency: None,
                    renewal_date: None,
                    confidence: 0,
                    subject: message.subject.clone().unwrap_or_default(),
                    sender: message.from_address.clone().unwrap_or_default(),
                    received_at: message.received_at(),
                }
            }
        }
    }

    fn try_parse(&self, message: &RawMessage) -> Result<ParsedSignal, PipelineError> {
        if message.id.trim().is_empty() {
            return Err(PipelineError::MalformedMessage("missing message id".to_string()));
        }

        let sender = message.from_address.as_deref().unwrap_or_default();
        let subject = message.subject.as_deref().unwrap_or_default();
        let snippet = message.snippet.as_deref().unwrap_or_default();
        if sender.contains('\0') || subject.contains('\0') || snippet.contains('\0') {
            return Err(PipelineError::MalformedMessage(
                "embedded NUL in headers".to_string(),
            ));
        }

        let (sender_name, sender_email) = split_sender(sender);
        let vendor = self.resolver.resolve(&sender_name, &sender_email, subject);

        let body = format!("{} {}", subject, snippet);
        let billing_cycle = detect_billing_cycle(&body);
        let transaction_types = detect_transaction_types(&body);
        let amount = extract_amount(&body);
        let renewal_date = extract_renewal_date(&body);

        let confidence = confidence_score(vendor.is_some(), billing_cycle.is_known(), amount.is_some());

        Ok(ParsedSignal {
            message_id: message.id.clone(),
            parsed: true,
            error: None,
            vendor,
            raw_vendor: if sender_name.is_empty() { sender_email } else { sender_name },
            billing_cycle,
            transaction_types,
            amount: amount.as_ref().map(|(value, _)| *value),
            currency: amount.map(|(_, code)| code.to_string()),
            renewal_date,
            confidence,
            subject: subject.to_string(),
            sender: sender.to_string(),
            received_at: message.received_at(),
        })
    }
}

pub fn confidence_score(vendor: bool, billing_cycle: bool, amount: bool) -> u8 {
    let mut score = 0;
    if vendor {
        score += VENDOR_WEIGHT;
    }
    if billing_cycle {
        score += BILLING_CYCLE_WEIGHT;
    }
    if amount {
        score += AMOUNT_WEIGHT;
    }
    score
}

pub fn detect_billing_cycle(text: &str) -> BillingCycle {
    BILLING_CYCLES
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(cycle, _)| *cycle)
        .unwrap_or(BillingCycle::Unknown)
}

/// Every matching family, in declaration order; `[Unknown]` when none match.
pub fn detect_transaction_types(text: &str) -> Vec<TransactionType> {
    let found: Vec<TransactionType> = TRANSACTION_TYPES
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(kind, _)| *kind)
        .collect();

    if found.is_empty() {
        vec![TransactionType::Unknown]
    } else {
        found
    }
}

/// First plausible amount in pattern priority order, with its currency code.
pub fn extract_amount(text: &str) -> Option<(f64, &'static str)> {
    for (code, re) in AMOUNT_PATTERNS.iter() {
        let Some(caps) = re.captures(text) else {
            continue;
        };
        let Some(raw) = caps.get(1) else {
            continue;
        };
        let Ok(value) = raw.as_str().replace(',', "").parse::<f64>() else {
            continue;
        };
        if value > MIN_AMOUNT && value < MAX_AMOUNT {
            return Some((value, *code));
        }
    }
    None
}

pub fn extract_renewal_date(text: &str) -> Option<NaiveDate> {
    let caps = RENEWAL_DATE.captures(text)?;
    let raw = caps.get(1)?.as_str().replace([',', '.'], "");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&raw, fmt).ok())
}
