//! Version numbering for successive builds of a document

/// First version assigned to a document
pub const INITIAL_VERSION: &str = "1.0.0";

/// Version following `previous`: the last numeric component is bumped.
///
/// `1.2.3` becomes `1.2.4`; a version without a numeric tail gets `.1`
/// appended.
pub fn next_version(previous: Option<&str>) -> String {
    let previous = match previous {
        Some(v) if !v.trim().is_empty() => v.trim(),
        _ => return INITIAL_VERSION.to_string(),
    };

    match previous.rsplit_once('.') {
        Some((head, tail)) => match tail.parse::<u64>() {
            Ok(n) => format!("{}.{}", head, n + 1),
            Err(_) => format!("{}.1", previous),
        },
        None => match previous.parse::<u64>() {
            Ok(n) => (n + 1).to_string(),
            Err(_) => format!("{}.1", previous),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version() {
        assert_eq!(next_version(None), "1.0.0");
        assert_eq!(next_version(Some("")), "1.0.0");
        assert_eq!(next_version(Some("1.0.0")), "1.0.1");
        assert_eq!(next_version(Some("2.3.9")), "2.3.10");
        assert_eq!(next_version(Some("7")), "8");
        assert_eq!(next_version(Some("1.0.0-rc")), "1.0.0-rc.1");
    }
}
