//! Topic name and filter handling
//!
//! Validation and wildcard matching for MQTT v3.1.1 topics (specification
//! section 4.7). Topic names carry no wildcards; filters may use `+` for a
//! single level and a trailing `#` for the rest of the tree, and neither
//! wildcard reaches into `$`-prefixed system topics at the first level.

/// Topics and filters are length-prefixed on the wire with two bytes
const MAX_TOPIC_BYTES: usize = 65535;

/// Validate a topic name (PUBLISH and will topics).
///
/// A topic name is non-empty, at most 65535 bytes, and contains neither NUL
/// nor wildcard characters.
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("empty topic name");
    }
    if topic.len() > MAX_TOPIC_BYTES {
        return Err("topic name longer than 65535 bytes");
    }
    for c in topic.chars() {
        match c {
            '\0' => return Err("NUL character in topic name"),
            '+' | '#' => return Err("wildcard in topic name"),
            _ => {}
        }
    }
    Ok(())
}

/// Validate a topic filter (SUBSCRIBE/UNSUBSCRIBE).
///
/// Same length and NUL rules as a topic name. A `+` or `#` must make up an
/// entire level, and `#` is only allowed as the final level.
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("empty topic filter");
    }
    if filter.len() > MAX_TOPIC_BYTES {
        return Err("topic filter longer than 65535 bytes");
    }
    if filter.contains('\0') {
        return Err("NUL character in topic filter");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "+" => {}
            "#" => {
                if levels.peek().is_some() {
                    return Err("# must be the final level");
                }
            }
            other if other.contains('+') || other.contains('#') => {
                return Err("wildcard must stand alone in its level");
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check whether a topic name matches a subscription filter.
///
/// Levels are compared pairwise: `+` consumes exactly one topic level, `#`
/// accepts whatever remains (including nothing), and anything else must be
/// equal. A `$`-topic is never matched by a filter that leads with a
/// wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    // [MQTT-4.7.2-1] wildcards do not match the first level of $-topics
    if topic.starts_with('$') && matches!(filter.as_bytes().first(), Some(b'+') | Some(b'#')) {
        return false;
    }

    let mut name = topic.split('/');
    let mut pattern = filter.split('/');

    loop {
        match (pattern.next(), name.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(wanted), Some(level)) if wanted == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
