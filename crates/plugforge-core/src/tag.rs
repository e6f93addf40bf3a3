use crate::feature::Feature;
use sha2::{Digest, Sha256};

/// Length of the abbreviated image tag.
pub const TAG_LEN: usize = 8;

/// Derive a short, deterministic image tag from an ordered feature set.
///
/// The digest covers each feature's name followed by its source revision, in
/// the order given, so reordering features or moving one to a new revision
/// yields a different tag.
pub fn compute_tag(features: &[Feature]) -> String {
    let mut hasher = Sha256::new();
    for feature in features {
        hasher.update(feature.name.as_bytes());
        hasher.update(feature.source_revision.as_bytes());
    }
    let mut tag = hex::encode(hasher.finalize());
    tag.truncate(TAG_LEN);
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(name: &str, rev: &str) -> Feature {
        Feature::new(name, "https://example.com/r.git", rev)
    }

    #[test]
    fn empty_set_is_digest_of_empty_input() {
        // SHA-256 of the empty string.
        assert_eq!(compute_tag(&[]), "e3b0c442");
    }

    #[test]
    fn tag_is_stable_and_short() {
        let features = vec![f("aws", "r1"), f("gcp", "r2")];
        let tag = compute_tag(&features);
        assert_eq!(tag.len(), TAG_LEN);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(tag, compute_tag(&features.clone()));
    }

    #[test]
    fn tag_depends_on_order_and_revision() {
        let a = compute_tag(&[f("aws", "r1"), f("gcp", "r2")]);
        let reordered = compute_tag(&[f("gcp", "r2"), f("aws", "r1")]);
        let bumped = compute_tag(&[f("aws", "r1"), f("gcp", "r3")]);
        assert_ne!(a, reordered);
        assert_ne!(a, bumped);
    }

    #[test]
    fn tag_matches_digest_of_concatenation() {
        let expected = hex::encode(Sha256::digest(b"awsr1gcpr2"));
        assert_eq!(
            compute_tag(&[f("aws", "r1"), f("gcp", "r2")]),
            expected[..TAG_LEN]
        );
    }
}
