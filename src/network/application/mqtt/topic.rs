//! Topic names, topic filters and wildcard matching.
//!
//! A topic filter may contain two wildcards:
//!
//! - `+` matches exactly one level, including an empty one, so `sport/+`
//!   matches `sport/`.
//! - `#` matches the rest of the name including zero levels, so `sport/#`
//!   matches both `sport` and `sport/tennis/player1`.
//!
//! Filters that start with a wildcard never match names that start with `$`
//! (broker internal topics such as `$SYS/...`).

use super::error::Error;

const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Match a topic name against a topic filter.
///
/// Both strings are walked once, level by level, left to right.
///
/// ```rust
/// use libiot_mqtt::network::application::mqtt::topic::matches;
///
/// assert!(matches("sport/tennis/player1", "sport/#"));
/// assert!(matches("sport", "sport/#"));
/// assert!(matches("a/b/c", "a/+/c"));
/// assert!(!matches("$SYS/x", "+/x"));
/// ```
pub fn matches(topic_name: &str, topic_filter: &str) -> bool {
    if topic_name.starts_with('$') && topic_filter.starts_with(['+', '#']) {
        return false;
    }

    let mut names = topic_name.split('/');
    let mut filters = topic_filter.split('/');
    loop {
        match (filters.next(), names.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(filter), Some(name)) if filter == name => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Check a filter before it is sent in a SUBSCRIBE or UNSUBSCRIBE.
pub fn validate_filter(filter: &str) -> Result<(), Error> {
    validate_common(filter)?;
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "+" => {}
            "#" if levels.peek().is_none() => {}
            "#" => return Err(Error::InvalidParameter("'#' must be the last level")),
            other if other.contains(['+', '#']) => {
                return Err(Error::InvalidParameter(
                    "wildcards must occupy a whole level",
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check a topic name before it is used in a PUBLISH or a will message.
pub fn validate_name(name: &str) -> Result<(), Error> {
    validate_common(name)?;
    if name.contains(['+', '#']) {
        return Err(Error::InvalidParameter("topic names cannot contain wildcards"));
    }
    Ok(())
}

fn validate_common(topic: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::InvalidParameter("topic is empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::InvalidParameter("topic is longer than 65535 bytes"));
    }
    if topic.contains('\0') {
        return Err(Error::InvalidParameter("topic contains NUL"));
    }
    Ok(())
}
