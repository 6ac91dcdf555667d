//! Deterministic action fingerprinting.
//!
//! The fingerprint binds a user to the semantic parameters of a check-in so
//! two requests can be recognized as the same logical action. Coordinates are
//! rounded to six decimal places (~0.11 m) before hashing so floating-point
//! jitter across retries cannot change the digest.

const ACTION_FINGERPRINT_DOMAIN: &[u8] = b"SESH:HASH:CHECKIN_ACTION:V1";
const FIELD_SEPARATOR: &[u8] = &[0];

pub fn action_fingerprint(user_id: &str, spot_id: &str, lat: f64, lng: f64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(ACTION_FINGERPRINT_DOMAIN);
    hasher.update(user_id.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(spot_id.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(canonical_coordinate(lat).as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(canonical_coordinate(lng).as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn canonical_coordinate(value: f64) -> String {
    format!("{value:.6}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let a = action_fingerprint("u1", "42", 37.7749, -122.4194);
        let b = action_fingerprint("u1", "42", 37.7749, -122.4194);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn sub_micro_degree_jitter_does_not_change_digest() {
        let a = action_fingerprint("u1", "42", 37.7749, -122.4194);
        let b = action_fingerprint("u1", "42", 37.77490000004, -122.41940000003);
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_inputs_produce_distinct_digests() {
        let base = action_fingerprint("u1", "42", 37.7749, -122.4194);
        assert_ne!(base, action_fingerprint("u2", "42", 37.7749, -122.4194));
        assert_ne!(base, action_fingerprint("u1", "43", 37.7749, -122.4194));
        assert_ne!(base, action_fingerprint("u1", "42", 37.7750, -122.4194));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        // "u1"+"2x" must not collide with "u12"+"x".
        assert_ne!(
            action_fingerprint("u1", "2x", 0.0, 0.0),
            action_fingerprint("u12", "x", 0.0, 0.0)
        );
    }
}
