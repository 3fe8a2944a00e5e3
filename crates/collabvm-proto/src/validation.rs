/// Username rules shared by registration, invites, and guest renames:
/// 3 to 20 characters drawn from alphanumerics, `_`, `-`, `.`, and space,
/// with no leading, trailing, or doubled spaces.
pub fn validate_username(username: &str) -> bool {
    let len = username.chars().count();
    if !(3..=20).contains(&len) {
        return false;
    }
    if username.starts_with(' ') || username.ends_with(' ') || username.contains("  ") {
        return false;
    }
    username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_reasonable_usernames() {
        for name in ["abc", "guest1000", "Some User", "a-b_c.d", "x".repeat(20).as_str()] {
            assert!(validate_username(name), "rejected {name:?}");
        }
    }

    #[test]
    fn rejects_bad_usernames() {
        for name in [
            "",
            "ab",
            " lead",
            "trail ",
            "two  spaces",
            "emoji😀name",
            "x".repeat(21).as_str(),
            "semi;colon",
        ] {
            assert!(!validate_username(name), "accepted {name:?}");
        }
    }
}
