//! The retention decision.
//!
//! First matching rule wins:
//! 1. whitelisted sender → keep
//! 2. transactions / feed → archive (never deleted, whatever the age or sender)
//! 3. inbox → keep
//! 4. promotions → keep if promotional deletion is off, if younger than the
//!    age threshold, or if a topic of interest matched; otherwise
//!    delete-or-label
//!
//! A blacklisted sender only ever lands in rule 4's last branch; it never
//! overrides the whitelist or a topic match.

use crate::config::{DeletionAction, DeletionSection};
use crate::pipeline::types::{
    Category, Classification, Decision, MailAction, SenderStatus, TopicMatch, Verdict,
};

/// Label applied when the deletion action is `apply_label`.
pub const DELETION_LABEL: &str = "MarkForDeletion";

/// Decide what to do with one message. Pure.
pub fn decide(
    classification: &Classification,
    topic_match: &TopicMatch,
    sender: SenderStatus,
    age_days: i64,
    policy: &DeletionSection,
) -> Verdict {
    let verdict = |decision: Decision, reason: String| Verdict { decision, reason };

    if sender == SenderStatus::Whitelisted {
        return verdict(Decision::Keep, "sender is whitelisted".into());
    }

    match classification.category {
        Category::Transactions | Category::Feed => verdict(
            Decision::Archive,
            format!("{} mail is archived", classification.category),
        ),
        Category::Inbox => verdict(Decision::Keep, "inbox mail is kept".into()),
        Category::Promotions => {
            if !policy.delete_promotional {
                verdict(Decision::Keep, "promotional deletion disabled".into())
            } else if age_days < i64::from(policy.age_threshold_days) {
                verdict(
                    Decision::Keep,
                    format!(
                        "promotion is {age_days}d old, under the {}d threshold",
                        policy.age_threshold_days
                    ),
                )
            } else if topic_match.matched {
                verdict(
                    Decision::Keep,
                    format!(
                        "promotion matches topics: {}",
                        topic_match.matched_topics.join(", ")
                    ),
                )
            } else {
                let reason = match sender {
                    SenderStatus::Blacklisted => {
                        format!("blacklisted sender, promotion {age_days}d old")
                    }
                    _ => format!("promotion {age_days}d old with no topic of interest"),
                };
                verdict(Decision::DeleteOrLabel, reason)
            }
        }
    }
}

/// Mailbox operation for a decision. `Keep` needs none.
pub fn mail_action_for(decision: Decision, policy: &DeletionSection) -> Option<MailAction> {
    match decision {
        Decision::Keep => None,
        Decision::Archive => Some(MailAction::MarkReadAndArchive),
        Decision::DeleteOrLabel => Some(match policy.action_on_deletion {
            DeletionAction::MoveToTrash => MailAction::MoveToTrash,
            DeletionAction::ApplyLabel => MailAction::ApplyLabel(DELETION_LABEL.to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ClassificationMethod;

    fn classification(category: Category) -> Classification {
        Classification {
            category,
            confidence: 0.9,
            method: ClassificationMethod::RuleBased,
        }
    }

    fn topic(matched: bool) -> TopicMatch {
        if matched {
            TopicMatch {
                matched: true,
                matched_topics: vec!["rust".into()],
                score: 0.2,
            }
        } else {
            TopicMatch::default()
        }
    }

    fn policy() -> DeletionSection {
        DeletionSection {
            age_threshold_days: 30,
            ..DeletionSection::default()
        }
    }

    #[test]
    fn old_untopical_promotion_is_deleted() {
        let v = decide(
            &classification(Category::Promotions),
            &topic(false),
            SenderStatus::Neutral,
            45,
            &policy(),
        );
        assert_eq!(v.decision, Decision::DeleteOrLabel);
    }

    #[test]
    fn whitelisted_old_promotion_is_kept() {
        let v = decide(
            &classification(Category::Promotions),
            &topic(false),
            SenderStatus::Whitelisted,
            45,
            &policy(),
        );
        assert_eq!(v.decision, Decision::Keep);
    }

    #[test]
    fn fresh_transaction_is_archived() {
        let v = decide(
            &classification(Category::Transactions),
            &topic(false),
            SenderStatus::Neutral,
            1,
            &policy(),
        );
        assert_eq!(v.decision, Decision::Archive);
    }

    #[test]
    fn whitelist_always_keeps() {
        for category in Category::ALL {
            for matched in [false, true] {
                for age in [0, 29, 30, 365] {
                    let v = decide(
                        &classification(category),
                        &topic(matched),
                        SenderStatus::Whitelisted,
                        age,
                        &policy(),
                    );
                    assert_eq!(v.decision, Decision::Keep, "{category} age {age}");
                }
            }
        }
    }

    #[test]
    fn topic_match_overrides_blacklist() {
        let v = decide(
            &classification(Category::Promotions),
            &topic(true),
            SenderStatus::Blacklisted,
            90,
            &policy(),
        );
        assert_eq!(v.decision, Decision::Keep);
    }

    #[test]
    fn feed_is_never_deleted() {
        for sender in [SenderStatus::Blacklisted, SenderStatus::Neutral] {
            let v = decide(
                &classification(Category::Feed),
                &topic(false),
                sender,
                1000,
                &policy(),
            );
            assert_eq!(v.decision, Decision::Archive);
        }
    }

    #[test]
    fn young_promotion_is_kept() {
        let v = decide(
            &classification(Category::Promotions),
            &topic(false),
            SenderStatus::Blacklisted,
            29,
            &policy(),
        );
        assert_eq!(v.decision, Decision::Keep);

        let at_threshold = decide(
            &classification(Category::Promotions),
            &topic(false),
            SenderStatus::Neutral,
            30,
            &policy(),
        );
        assert_eq!(at_threshold.decision, Decision::DeleteOrLabel);
    }

    #[test]
    fn disabled_promotional_deletion_keeps() {
        let policy = DeletionSection {
            delete_promotional: false,
            ..policy()
        };
        let v = decide(
            &classification(Category::Promotions),
            &topic(false),
            SenderStatus::Neutral,
            400,
            &policy,
        );
        assert_eq!(v.decision, Decision::Keep);
    }

    #[test]
    fn inbox_is_kept() {
        let v = decide(
            &classification(Category::Inbox),
            &topic(false),
            SenderStatus::Blacklisted,
            400,
            &policy(),
        );
        assert_eq!(v.decision, Decision::Keep);
    }

    #[test]
    fn decide_is_idempotent() {
        let c = classification(Category::Promotions);
        let t = topic(false);
        let first = decide(&c, &t, SenderStatus::Neutral, 45, &policy());
        let second = decide(&c, &t, SenderStatus::Neutral, 45, &policy());
        assert_eq!(first, second);
    }

    #[test]
    fn deletion_action_follows_policy() {
        let trash = policy();
        assert_eq!(
            mail_action_for(Decision::DeleteOrLabel, &trash),
            Some(MailAction::MoveToTrash)
        );

        let label = DeletionSection {
            action_on_deletion: DeletionAction::ApplyLabel,
            ..policy()
        };
        assert_eq!(
            mail_action_for(Decision::DeleteOrLabel, &label),
            Some(MailAction::ApplyLabel(DELETION_LABEL.into()))
        );
        assert_eq!(
            mail_action_for(Decision::Archive, &label),
            Some(MailAction::MarkReadAndArchive)
        );
        assert_eq!(mail_action_for(Decision::Keep, &label), None);
    }
}
