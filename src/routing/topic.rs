//! MQTT topic names, filters and wildcard matching
//!
//! Topic filters follow the MQTT grammar:
//!
//! - `+` matches exactly one topic level
//! - `#` matches zero or more trailing levels and is only legal as the last level
//! - both wildcards must occupy a whole level (`a/b+` is invalid)
//!
//! Topics starting with `$` are never matched by a leading wildcard,
//! so `#` does not receive `$SYS/...` traffic while `$SYS/#` does.

use thiserror::Error;

/// Topic and topic-filter validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("Topic must not be empty")]
    Empty,
    #[error("Topic '{0}' contains a NUL character")]
    NulCharacter(String),
    #[error("Wildcard '{wildcard}' must occupy a whole level in '{pattern}'")]
    PartialWildcard { pattern: String, wildcard: char },
    #[error("Multi-level wildcard '#' must be the last level in '{0}'")]
    MisplacedMultiLevel(String),
    #[error("Topic name '{0}' must not contain wildcards")]
    WildcardInTopicName(String),
}

/// Validate a subscription filter such as `brewcast/history/#`
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::Empty);
    }
    if pattern.contains('\0') {
        return Err(TopicError::NulCharacter(pattern.to_string()));
    }

    let levels: Vec<&str> = pattern.split('/').collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        for wildcard in ['+', '#'] {
            if level.contains(wildcard) && level.len() > 1 {
                return Err(TopicError::PartialWildcard {
                    pattern: pattern.to_string(),
                    wildcard,
                });
            }
        }
        if *level == "#" && index != last {
            return Err(TopicError::MisplacedMultiLevel(pattern.to_string()));
        }
    }

    Ok(())
}

/// Validate a concrete topic name used for publishing
pub fn validate_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter(topic.to_string()));
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

/// Check whether `topic` is matched by the subscription filter `pattern`.
///
/// `a/+/c` matches `a/b/c` but not `a/c` or `a/b/x/c`.
/// `a/#` matches `a`, `a/b` and `a/b/c`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/').peekable();

    if topic.starts_with('$') && (pattern.starts_with('+') || pattern.starts_with('#')) {
        return false;
    }

    loop {
        match (pattern_levels.next(), topic_levels.peek()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {
                topic_levels.next();
            }
            (Some(expected), Some(actual)) if expected == *actual => {
                topic_levels.next();
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Join a base topic and a suffix with exactly one separator
pub fn join_topic(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    match (base.is_empty(), suffix.is_empty()) {
        (true, _) => suffix.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{suffix}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(topic_matches("a/+/c", "a/x/c"));
        assert!(!topic_matches("a/+/c", "a/c"));
        assert!(!topic_matches("a/+/c", "a/b/x/c"));
        assert!(topic_matches("+", "a"));
        assert!(!topic_matches("+", "a/b"));
        assert!(topic_matches("a/+", "a/"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/b"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(!topic_matches("a/#", "b"));
        assert!(!topic_matches("a/#", "ab"));
        assert!(topic_matches("#", "anything/at/all"));
    }

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("brewcast/history", "brewcast/history"));
        assert!(!topic_matches("brewcast/history", "brewcast/history/x"));
        assert!(!topic_matches("brewcast/history/x", "brewcast/history"));
    }

    #[test]
    fn test_dollar_topics_not_matched_by_leading_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/load"));
        assert!(!topic_matches("+/broker/load", "$SYS/broker/load"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/load"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("a/+/c").is_ok());
        assert!(validate_pattern("a/#").is_ok());
        assert!(validate_pattern("#").is_ok());
        assert_eq!(validate_pattern(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_pattern("a/#/c"),
            Err(TopicError::MisplacedMultiLevel(_))
        ));
        assert!(matches!(
            validate_pattern("a/b+"),
            Err(TopicError::PartialWildcard { wildcard: '+', .. })
        ));
        assert!(matches!(
            validate_pattern("a/b#"),
            Err(TopicError::PartialWildcard { wildcard: '#', .. })
        ));
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("brewcast/history/service").is_ok());
        assert_eq!(validate_topic(""), Err(TopicError::Empty));
        assert!(matches!(
            validate_topic("a/+/c"),
            Err(TopicError::WildcardInTopicName(_))
        ));
    }

    #[test]
    fn test_join_topic() {
        assert_eq!(join_topic("brewcast/history", "svc"), "brewcast/history/svc");
        assert_eq!(join_topic("brewcast/history/", "/svc"), "brewcast/history/svc");
        assert_eq!(join_topic("", "svc"), "svc");
        assert_eq!(join_topic("base", ""), "base");
    }
}
