//! Decide whether an inbound message should trigger a pipeline run.

use crate::channels::InboundMessage;

/// Which automated authors may trigger the relay.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClassifierMode {
    /// Automated authors are always ignored.
    #[default]
    Normal,
    /// Only the designated automated caller is accepted (e.g. a test harness bot).
    /// With no designated caller every automated author is still rejected.
    Test {
        designated_caller_id: Option<String>,
    },
}

/// Raw-text form of a user mention. Discord renders it as `<@id>`, or `<@!id>` for nicknames.
pub fn mention_token(user_id: &str) -> String {
    format!("<@{}>", user_id)
}

fn text_mentions(text: &str, user_id: &str) -> bool {
    text.contains(&mention_token(user_id)) || text.contains(&format!("<@!{}>", user_id))
}

/// Message gate for one handling identity.
#[derive(Debug, Clone)]
pub struct MessageClassifier {
    self_id: String,
    mode: ClassifierMode,
}

impl MessageClassifier {
    pub fn new(self_id: impl Into<String>, mode: ClassifierMode) -> Self {
        Self {
            self_id: self_id.into(),
            mode,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn mode(&self) -> &ClassifierMode {
        &self.mode
    }

    pub fn should_process(&self, message: &InboundMessage) -> bool {
        should_process(message, &self.self_id, &self.mode)
    }
}

/// First matching rule wins:
/// 1. own messages are rejected, whatever they contain;
/// 2. automated authors are rejected, except the designated caller in test mode;
/// 3. everything else is accepted only when it mentions `self_id`, either through the
///    platform's parsed mentions or the raw mention token in the text.
pub fn should_process(message: &InboundMessage, self_id: &str, mode: &ClassifierMode) -> bool {
    if message.author_id == self_id {
        log::debug!("classifier: skipping own message {}", message.id);
        return false;
    }

    let has_mention =
        message.mentioned_user_ids.contains(self_id) || text_mentions(&message.text, self_id);

    if message.author_is_automated {
        let accepted = match mode {
            ClassifierMode::Normal => false,
            ClassifierMode::Test {
                designated_caller_id,
            } => designated_caller_id.as_deref() == Some(message.author_id.as_str()),
        };
        log::debug!(
            "classifier: automated author {} on {} (mention: {}): {}",
            message.author_id,
            message.id,
            has_mention,
            if accepted { "accepted" } else { "rejected" }
        );
        return accepted;
    }

    if !has_mention {
        log::debug!("classifier: {} does not mention {}", message.id, self_id);
    }
    has_mention
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const SELF_ID: &str = "100";
    const CALLER_ID: &str = "555";

    fn message(author_id: &str, automated: bool, text: &str, mentions: &[&str]) -> InboundMessage {
        InboundMessage {
            id: "m1".to_string(),
            channel_id: "c1".to_string(),
            author_id: author_id.to_string(),
            author_name: "someone".to_string(),
            author_is_automated: automated,
            text: text.to_string(),
            mentioned_user_ids: mentions.iter().map(|s| s.to_string()).collect::<HashSet<_>>(),
            created_at: "2024-05-01T12:00:00Z".to_string(),
        }
    }

    fn test_mode() -> ClassifierMode {
        ClassifierMode::Test {
            designated_caller_id: Some(CALLER_ID.to_string()),
        }
    }

    #[test]
    fn own_messages_are_never_processed() {
        let text = format!("{} loop?", mention_token(SELF_ID));
        for automated in [false, true] {
            let msg = message(SELF_ID, automated, &text, &[SELF_ID]);
            assert!(!should_process(&msg, SELF_ID, &ClassifierMode::Normal));
            assert!(!should_process(&msg, SELF_ID, &test_mode()));
        }
    }

    #[test]
    fn parsed_mention_is_accepted() {
        let msg = message("7", false, "hey there", &[SELF_ID]);
        assert!(should_process(&msg, SELF_ID, &ClassifierMode::Normal));
    }

    #[test]
    fn raw_mention_token_is_accepted_without_parsed_mentions() {
        let msg = message("7", false, "<@100> what's up", &[]);
        assert!(should_process(&msg, SELF_ID, &ClassifierMode::Normal));
        let msg = message("7", false, "<@!100> nickname form", &[]);
        assert!(should_process(&msg, SELF_ID, &ClassifierMode::Normal));
    }

    #[test]
    fn unmentioned_human_message_is_skipped() {
        let msg = message("7", false, "talking to someone else <@200>", &["200"]);
        assert!(!should_process(&msg, SELF_ID, &ClassifierMode::Normal));
    }

    #[test]
    fn automated_authors_are_rejected_in_normal_mode() {
        for author in ["8", CALLER_ID] {
            let msg = message(author, true, "<@100> run this", &[SELF_ID]);
            assert!(!should_process(&msg, SELF_ID, &ClassifierMode::Normal));
        }
    }

    #[test]
    fn test_mode_accepts_only_the_designated_caller() {
        let caller = message(CALLER_ID, true, "no mention needed", &[]);
        assert!(should_process(&caller, SELF_ID, &test_mode()));

        let other = message("8", true, "<@100> run this", &[SELF_ID]);
        assert!(!should_process(&other, SELF_ID, &test_mode()));

        let no_designee = ClassifierMode::Test {
            designated_caller_id: None,
        };
        assert!(!should_process(&caller, SELF_ID, &no_designee));
    }

    #[test]
    fn test_mode_still_requires_mentions_from_humans() {
        let msg = message("7", false, "no mention", &[]);
        assert!(!should_process(&msg, SELF_ID, &test_mode()));
        let msg = message("7", false, "<@100> hi", &[]);
        assert!(should_process(&msg, SELF_ID, &test_mode()));
    }

    #[test]
    fn classifier_wraps_the_predicate() {
        let classifier = MessageClassifier::new(SELF_ID, ClassifierMode::Normal);
        assert_eq!(classifier.self_id(), SELF_ID);
        assert!(classifier.should_process(&message("7", false, "hi", &[SELF_ID])));
        assert!(!classifier.should_process(&message("7", false, "hi", &[])));
    }
}
