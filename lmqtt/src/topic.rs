use std::fmt;

#[inline]
fn is_metadata<T: AsRef<str>>(s: T) -> bool {
    s.as_ref().starts_with('$')
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    InvalidTopic(String),
    InvalidFilter(String),
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicError::InvalidTopic(s) => {
                write!(f, "InvalidTopic({})", s)
            }
            TopicError::InvalidFilter(s) => {
                write!(f, "InvalidFilter({})", s)
            }
        }
    }
}

/// Checks a topic name used in PUBLISH: non-empty and free of wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::InvalidTopic("empty topic".into()));
    }
    if topic.contains(['+', '#']) {
        return Err(TopicError::InvalidTopic(format!("topic `{}` contains +|#", topic)));
    }
    Ok(())
}

/// Checks a topic filter used in SUBSCRIBE: `+` must occupy a whole level and `#` must be
/// the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::InvalidFilter("empty filter".into()));
    }
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err(TopicError::InvalidFilter(format!("`#` must be the last level in `{}`", filter)))
            }
            "#" | "+" => {}
            _ if level.contains(['+', '#']) => {
                return Err(TopicError::InvalidFilter(format!(
                    "wildcard must occupy an entire level in `{}`",
                    filter
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Returns true if `topic` matches `filter`.
///
/// Topics starting with `$` are not matched by filters starting with a wildcard.
pub fn is_match(filter: &str, topic: &str) -> bool {
    if is_metadata(topic) && filter.starts_with(['+', '#']) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
