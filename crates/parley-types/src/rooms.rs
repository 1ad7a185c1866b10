//! Room identity for private 1:1 conversations.

/// Deterministic room token for a private conversation between two users.
/// The ids are ordered ascending so both participants compute the same
/// token regardless of who sends first.
pub fn private_room_token(a: i64, b: i64) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("private_{lo}_{hi}")
}

/// Group rooms are identified by the group token itself; private rooms
/// carry the `private_` prefix. Legacy message rows without an explicit
/// group flag are classified by this.
pub fn is_group_room(room_id: &str) -> bool {
    !room_id.starts_with("private_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_order_independent() {
        assert_eq!(private_room_token(5, 9), private_room_token(9, 5));
        assert_eq!(private_room_token(5, 9), "private_5_9");
    }

    #[test]
    fn distinct_pairs_get_distinct_tokens() {
        assert_ne!(private_room_token(1, 2), private_room_token(1, 3));
        assert_ne!(private_room_token(1, 2), private_room_token(2, 3));
    }

    #[test]
    fn same_user_pair_token_is_stable() {
        assert_eq!(private_room_token(7, 7), "private_7_7");
    }

    #[test]
    fn room_classification() {
        assert!(!is_group_room("private_5_9"));
        assert!(is_group_room("3f2a7c1e-0000-0000-0000-000000000000"));
    }
}
