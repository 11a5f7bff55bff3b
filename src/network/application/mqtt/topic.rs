//! Topic name and topic filter validation.
//!
//! Only the syntax is checked here. Matching filters against topics is the
//! broker's business.

use super::codec::utf8;
use super::error::Error;

/// Multi-level wildcard.
pub const MULTI_LEVEL_WILDCARD: char = '#';
/// Single-level wildcard.
pub const SINGLE_LEVEL_WILDCARD: char = '+';
/// Level separator.
pub const SEPARATOR: char = '/';

fn check_common(topic: &str, what: &str) -> Result<(), Error> {
    if topic.is_empty() {
        return Err(Error::InvalidArgument(format!("{what} must not be empty")));
    }
    if topic.len() > utf8::MAX_FIELD_LEN {
        return Err(Error::InvalidArgument(format!("{what} is too long")));
    }
    if topic.contains('\0') {
        return Err(Error::InvalidArgument(format!("{what} contains a null character")));
    }
    utf8::validate(topic)
}

/// Check a topic that is published to. Wildcards are not allowed.
pub fn validate_topic_name(topic: &str) -> Result<(), Error> {
    check_common(topic, "topic name")?;
    if topic.contains([MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD]) {
        return Err(Error::InvalidArgument(format!(
            "topic name '{topic}' contains a wildcard"
        )));
    }
    Ok(())
}

/// Check a subscription filter.
///
/// `+` must occupy a whole level; `#` must occupy the last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), Error> {
    check_common(filter, "topic filter")?;
    let mut levels = filter.split(SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        if level.contains(MULTI_LEVEL_WILDCARD) && (level.len() != 1 || !is_last) {
            return Err(Error::InvalidArgument(format!(
                "'#' must be the last level of '{filter}'"
            )));
        }
        if level.contains(SINGLE_LEVEL_WILDCARD) && level.len() != 1 {
            return Err(Error::InvalidArgument(format!(
                "'+' must occupy a whole level of '{filter}'"
            )));
        }
    }
    Ok(())
}
