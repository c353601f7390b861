//! Sender reputation from the agent's white- and blacklists.
//!
//! Entries are either exact addresses or `*` globs over the local part, the
//! domain, or both (`*@domain.com`, `user@*`, `*deals*@*.com`). Matching is
//! case-insensitive and a whitelist hit always beats a blacklist hit.

use regex::Regex;
use tracing::warn;

use crate::pipeline::types::SenderStatus;

#[derive(Debug, Clone)]
enum SenderPattern {
    Exact(String),
    Glob(Regex),
}

impl SenderPattern {
    fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim().to_lowercase();
        if entry.is_empty() {
            return None;
        }
        if !entry.contains('*') {
            return Some(Self::Exact(entry));
        }
        let pattern = entry
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        match Regex::new(&format!("(?i)^{pattern}$")) {
            Ok(re) => Some(Self::Glob(re)),
            Err(e) => {
                warn!(entry = %entry, error = %e, "Skipping unusable sender pattern");
                None
            }
        }
    }

    fn matches(&self, sender: &str) -> bool {
        match self {
            Self::Exact(addr) => addr == sender,
            Self::Glob(re) => re.is_match(sender),
        }
    }
}

/// Compiled white/blacklists for one agent.
#[derive(Debug, Clone, Default)]
pub struct SenderManager {
    whitelist: Vec<SenderPattern>,
    blacklist: Vec<SenderPattern>,
}

impl SenderManager {
    pub fn new<S: AsRef<str>>(whitelist: &[S], blacklist: &[S]) -> Self {
        Self {
            whitelist: whitelist
                .iter()
                .filter_map(|e| SenderPattern::parse(e.as_ref()))
                .collect(),
            blacklist: blacklist
                .iter()
                .filter_map(|e| SenderPattern::parse(e.as_ref()))
                .collect(),
        }
    }

    pub fn status(&self, sender: &str) -> SenderStatus {
        let sender = sender.trim().to_lowercase();
        if self.whitelist.iter().any(|p| p.matches(&sender)) {
            SenderStatus::Whitelisted
        } else if self.blacklist.iter().any(|p| p.matches(&sender)) {
            SenderStatus::Blacklisted
        } else {
            SenderStatus::Neutral
        }
    }

    pub fn is_whitelisted(&self, sender: &str) -> bool {
        self.status(sender) == SenderStatus::Whitelisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(white: &[&str], black: &[&str]) -> SenderManager {
        SenderManager::new(white, black)
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let m = manager(&["Boss@Corp.com"], &[]);
        assert_eq!(m.status("boss@corp.com"), SenderStatus::Whitelisted);
        assert_eq!(m.status("BOSS@CORP.COM"), SenderStatus::Whitelisted);
        assert_eq!(m.status("other@corp.com"), SenderStatus::Neutral);
    }

    #[test]
    fn domain_wildcard() {
        let m = manager(&[], &["*@spam.com"]);
        assert_eq!(m.status("anyone@spam.com"), SenderStatus::Blacklisted);
        assert_eq!(m.status("anyone@notspam.com"), SenderStatus::Neutral);
        assert_eq!(m.status("anyone@spam.com.evil"), SenderStatus::Neutral);
    }

    #[test]
    fn local_part_wildcard() {
        let m = manager(&[], &["noreply@*"]);
        assert_eq!(m.status("noreply@github.com"), SenderStatus::Blacklisted);
        assert_eq!(m.status("reply@github.com"), SenderStatus::Neutral);
    }

    #[test]
    fn substring_and_domain_wildcards() {
        let m = manager(&[], &["*deals*@*.com"]);
        assert_eq!(m.status("hotdeals123@shop.com"), SenderStatus::Blacklisted);
        assert_eq!(m.status("hotdeals@shop.org"), SenderStatus::Neutral);
    }

    #[test]
    fn regex_characters_are_literal() {
        let m = manager(&["a+b@x.com"], &["*@x.c?m"]);
        assert_eq!(m.status("a+b@x.com"), SenderStatus::Whitelisted);
        assert_eq!(m.status("z@x.com"), SenderStatus::Neutral);
    }

    #[test]
    fn whitelist_beats_blacklist() {
        let m = manager(&["ceo@corp.com"], &["*@corp.com"]);
        assert_eq!(m.status("ceo@corp.com"), SenderStatus::Whitelisted);
        assert_eq!(m.status("intern@corp.com"), SenderStatus::Blacklisted);
        assert!(m.is_whitelisted("ceo@corp.com"));
    }

    #[test]
    fn blank_entries_are_ignored() {
        let m = manager(&["  "], &[""]);
        assert_eq!(m.status(""), SenderStatus::Neutral);
    }
}
