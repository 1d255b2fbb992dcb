use super::*;

#[test]
fn display_prefixes_are_stable() {
    assert!(
        ResolveError::validation("x")
            .to_string()
            .contains("validation error:")
    );
    assert!(ResolveError::effect("x").to_string().contains("effect error:"));
    assert!(
        ResolveError::conversion("x")
            .to_string()
            .contains("conversion error:")
    );
}

#[test]
fn abort_is_not_a_failure_variant() {
    assert!(ResolveError::Aborted.is_abort());
    assert!(!ResolveError::effect("boom").is_abort());
}

#[test]
fn other_preserves_source() {
    let base = std::io::Error::other("boom");
    let err = ResolveError::Other(anyhow::Error::new(base));
    assert!(err.to_string().contains("boom"));
}
