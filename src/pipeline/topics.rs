//! Topic relevance scoring.
//!
//! Every configured topic expands into lexical variants (compound and
//! hyphenated forms, a simple plural, known abbreviations). Each variant that
//! appears in a field adds its weight once:
//!
//! | variant kind | subject | body |
//! |--------------|---------|------|
//! | single word  | 2.0     | 1.0  |
//! | phrase       | 4.0     | 2.0  |
//!
//! The total is normalized as `min(total / 10, 1)`.

use regex::Regex;

use crate::pipeline::types::{ParsedEmail, TopicMatch};

const KEYWORD_SUBJECT: f64 = 2.0;
const KEYWORD_BODY: f64 = 1.0;
const PHRASE_SUBJECT: f64 = 4.0;
const PHRASE_BODY: f64 = 2.0;
const NORMALIZER: f64 = 10.0;

/// Well-known abbreviations and spellings, keyed by lowercased topic.
const ABBREVIATIONS: &[(&str, &[&str])] = &[
    ("machine learning", &["ml"]),
    ("artificial intelligence", &["ai"]),
    ("kubernetes", &["k8s"]),
    ("natural language processing", &["nlp"]),
    ("large language model", &["llm", "llms"]),
    ("large language models", &["llm", "llms"]),
    ("javascript", &["js"]),
    ("typescript", &["ts"]),
    ("continuous integration", &["ci"]),
];

#[derive(Debug, Clone)]
struct Variant {
    regex: Regex,
    is_phrase: bool,
}

#[derive(Debug, Clone)]
struct Topic {
    name: String,
    variants: Vec<Variant>,
}

/// Compiled topic set for one agent.
#[derive(Debug, Clone, Default)]
pub struct TopicMatcher {
    topics: Vec<Topic>,
}

impl TopicMatcher {
    pub fn new<S: AsRef<str>>(topics: &[S]) -> Self {
        let topics = topics
            .iter()
            .map(|t| t.as_ref().trim())
            .filter(|t| !t.is_empty())
            .map(|t| Topic {
                name: t.to_string(),
                variants: expand_variants(t)
                    .into_iter()
                    .map(|v| Variant {
                        is_phrase: v.contains(' '),
                        regex: variant_regex(&v),
                    })
                    .collect(),
            })
            .collect();
        Self { topics }
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn match_email(&self, email: &ParsedEmail) -> TopicMatch {
        self.match_text(&email.subject, &email.body_excerpt)
    }

    /// Score subject and body against every topic.
    pub fn match_text(&self, subject: &str, body: &str) -> TopicMatch {
        let mut total = 0.0;
        let mut matched_topics = Vec::new();

        for topic in &self.topics {
            let mut topic_total = 0.0;
            for variant in &topic.variants {
                let (subject_weight, body_weight) = if variant.is_phrase {
                    (PHRASE_SUBJECT, PHRASE_BODY)
                } else {
                    (KEYWORD_SUBJECT, KEYWORD_BODY)
                };
                if variant.regex.is_match(subject) {
                    topic_total += subject_weight;
                }
                if variant.regex.is_match(body) {
                    topic_total += body_weight;
                }
            }
            if topic_total > 0.0 {
                matched_topics.push(topic.name.clone());
                total += topic_total;
            }
        }

        let score = (total / NORMALIZER).min(1.0);
        TopicMatch {
            matched: score > 0.0,
            matched_topics,
            score,
        }
    }
}

/// Lowercased lexical variants of a topic, deduplicated, original first.
pub fn expand_variants(topic: &str) -> Vec<String> {
    let base = topic
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut variants = vec![base.clone()];

    if base.contains(' ') {
        variants.push(base.replace(' ', ""));
        variants.push(base.replace(' ', "-"));
    }
    if !base.ends_with('s') {
        variants.push(format!("{base}s"));
    }
    if let Some((_, abbrevs)) = ABBREVIATIONS.iter().find(|(name, _)| *name == base) {
        variants.extend(abbrevs.iter().map(|a| a.to_string()));
    }

    let mut seen = std::collections::HashSet::new();
    variants.retain(|v| seen.insert(v.clone()));
    variants
}

/// Whole-word, case-insensitive regex; spaces in phrases match any run of
/// whitespace.
fn variant_regex(variant: &str) -> Regex {
    let body = variant
        .split(' ')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    // Every piece is escaped, so the pattern is always valid.
    Regex::new(&format!(r"(?i)\b{body}\b")).unwrap()
}
