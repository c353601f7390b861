//! Rule-based category classifier.
//!
//! Scores every category from keyword hits in the subject and body and from
//! fragments of the sender's address:
//! - each distinct keyword present → +1
//! - each sender-domain fragment present → +2
//! - an unsubscribe / opt-out footer → +2 feed if feed already scored,
//!   otherwise +3 promotions
//!
//! The highest score wins, equal scores go to the earlier category in
//! `transactions > feed > promotions`, and anything below [`MIN_SCORE`] is
//! `inbox`. Pure and collaborator-free.

use regex::Regex;
use tracing::debug;

use crate::pipeline::types::{Category, Classification, ClassificationMethod, ParsedEmail};

/// Minimum winning score; below it the message stays in the inbox.
pub const MIN_SCORE: u32 = 2;

/// Confidence reported for the inbox default.
pub const INBOX_CONFIDENCE: f64 = 0.6;

const KEYWORD_WEIGHT: u32 = 1;
const DOMAIN_WEIGHT: u32 = 2;
const FEED_FOOTER_BONUS: u32 = 2;
const PROMO_FOOTER_BONUS: u32 = 3;

/// Keyword and sender-domain signals for one category.
#[derive(Debug, Clone)]
pub struct CategoryRule {
    pub category: Category,
    /// Compiled keyword patterns, matched against subject + body.
    pub keywords: Vec<Regex>,
    /// Substrings matched against the sender address.
    pub domains: Vec<String>,
}

impl CategoryRule {
    fn new(category: Category, keywords: &[&str], domains: &[&str]) -> Self {
        Self {
            category,
            keywords: keywords.iter().map(|k| keyword_regex(k)).collect(),
            domains: domains.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn score(&self, text: &str, sender: &str) -> u32 {
        let keyword_hits = self.keywords.iter().filter(|r| r.is_match(text)).count() as u32;
        let domain_hits = self
            .domains
            .iter()
            .filter(|d| sender.contains(d.as_str()))
            .count() as u32;
        keyword_hits * KEYWORD_WEIGHT + domain_hits * DOMAIN_WEIGHT
    }
}

/// Whole-word, case-insensitive pattern for a keyword. Entries already
/// written as regexes (containing `\`) are used as-is.
fn keyword_regex(keyword: &str) -> Regex {
    let pattern = if keyword.contains('\\') {
        format!("(?i){keyword}")
    } else {
        format!(r"(?i)\b{}\b", regex::escape(keyword))
    };
    // Built only from the static tables below.
    Regex::new(&pattern).unwrap()
}

/// Per-category scores for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryScores {
    pub transactions: u32,
    pub feed: u32,
    pub promotions: u32,
}

impl CategoryScores {
    pub fn get(&self, category: Category) -> u32 {
        match category {
            Category::Transactions => self.transactions,
            Category::Feed => self.feed,
            Category::Promotions => self.promotions,
            Category::Inbox => 0,
        }
    }

    fn add(&mut self, category: Category, points: u32) {
        match category {
            Category::Transactions => self.transactions += points,
            Category::Feed => self.feed += points,
            Category::Promotions => self.promotions += points,
            Category::Inbox => {}
        }
    }

    /// Highest-scoring category, earlier categories winning ties, and its
    /// score.
    pub fn leader(&self) -> (Category, u32) {
        let mut best = (Category::Inbox, 0);
        for category in [Category::Transactions, Category::Feed, Category::Promotions] {
            let score = self.get(category);
            if score > best.1 {
                best = (category, score);
            }
        }
        best
    }
}

/// Keyword/domain scoring classifier.
pub struct RuleClassifier {
    rules: Vec<CategoryRule>,
    footer: Regex,
}

impl RuleClassifier {
    /// Classifier with the built-in keyword and domain tables.
    pub fn default_rules() -> Self {
        let rules = vec![
            CategoryRule::new(
                Category::Transactions,
                &[
                    "invoice",
                    "payment",
                    "bill",
                    "receipt",
                    "transaction",
                    "charged",
                    "refund",
                    "stock",
                    "trade",
                    "dividend",
                    "statement",
                    "balance",
                    "due",
                    "paid",
                    "purchase",
                    "order",
                    "confirmation",
                    "shipped",
                    "delivery",
                ],
                &[
                    "paypal", "stripe", "bank", "zerodha", "groww", "amazon", "flipkart",
                    "razorpay",
                ],
            ),
            CategoryRule::new(
                Category::Feed,
                &[
                    "newsletter",
                    "digest",
                    "weekly",
                    "daily",
                    "tutorial",
                    "launch",
                    "announcement",
                    "update",
                    "blog",
                    "article",
                    "podcast",
                    "episode",
                    "issue",
                    "edition",
                ],
                &[
                    "substack",
                    "medium",
                    "beehiiv",
                    "buttondown",
                    "mailchimp",
                    "convertkit",
                ],
            ),
            CategoryRule::new(
                Category::Promotions,
                &[
                    "sale",
                    "discount",
                    "offer",
                    "deal",
                    "limited time",
                    "buy now",
                    "shop",
                    "coupon",
                    "free shipping",
                    r"\d+\s*%\s*off\b",
                    "save",
                    "clearance",
                    "exclusive",
                ],
                &["marketing", "promo", "offers"],
            ),
        ];

        Self {
            rules,
            footer: Regex::new(r"(?i)\b(unsubscribe|opt[- ]?out)\b").unwrap(),
        }
    }

    /// Create an empty classifier (everything lands in the inbox).
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            footer: Regex::new(r"(?i)\b(unsubscribe|opt[- ]?out)\b").unwrap(),
        }
    }

    /// Score raw fields. `sender` is matched case-insensitively.
    pub fn scores(&self, subject: &str, body: &str, sender: &str) -> CategoryScores {
        let text = format!("{subject}\n{body}");
        let sender = sender.to_lowercase();

        let mut scores = CategoryScores::default();
        for rule in &self.rules {
            scores.add(rule.category, rule.score(&text, &sender));
        }

        if self.footer.is_match(&text) {
            if scores.feed > 0 {
                scores.feed += FEED_FOOTER_BONUS;
            } else {
                scores.promotions += PROMO_FOOTER_BONUS;
            }
        }
        scores
    }

    /// Classify a parsed message. Always returns a category.
    pub fn classify(&self, email: &ParsedEmail) -> Classification {
        let scores = self.scores(&email.subject, &email.body_excerpt, &email.from_address);
        let classification = Self::from_scores(scores);
        debug!(
            hash = %email.hash,
            category = %classification.category,
            ?scores,
            "Rule-based classification"
        );
        classification
    }

    /// Turn scores into a classification with confidence
    /// `min(0.5 + 0.1 * score, 0.95)`.
    pub fn from_scores(scores: CategoryScores) -> Classification {
        let (category, score) = scores.leader();
        if score < MIN_SCORE {
            return Classification {
                category: Category::Inbox,
                confidence: INBOX_CONFIDENCE,
                method: ClassificationMethod::RuleBased,
            };
        }
        Classification {
            category,
            confidence: (0.5 + 0.1 * f64::from(score)).min(0.95),
            method: ClassificationMethod::RuleBased,
        }
    }
}

impl Default for RuleClassifier {
    fn default() -> Self {
        Self::default_rules()
    }
}
