//! Capability tokens: signed, expiring grants scoped to a tool-name
//! pattern, a set of operations and a list of constraints.

pub mod token;
pub mod validator;

pub use token::{CapabilityToken, ToolPattern};
pub use validator::{TokenIndex, TokenValidator, TrustStore, ValidityResult};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn segment() -> impl Strategy<Value = String> {
        "[a-z][a-zA-Z0-9_]{0,6}"
    }

    proptest! {
        // A namespace pattern covers exactly the names strictly below it.
        #[test]
        fn namespace_pattern_matches_only_descendants(
            ns in prop::collection::vec(segment(), 1..4),
            rest in prop::collection::vec(segment(), 0..3),
        ) {
            let pattern = ToolPattern::parse(&format!("{}.*", ns.join("."))).unwrap();
            let mut name = ns.clone();
            name.extend(rest.iter().cloned());
            prop_assert_eq!(pattern.matches(&name.join(".")), !rest.is_empty());
        }

        #[test]
        fn exact_pattern_matches_only_itself(
            a in prop::collection::vec(segment(), 1..4),
            b in prop::collection::vec(segment(), 1..4),
        ) {
            let pattern = ToolPattern::exact(&a.join(".")).unwrap();
            prop_assert!(pattern.matches(&a.join(".")));
            prop_assert_eq!(pattern.matches(&b.join(".")), a == b);
        }

        #[test]
        fn parse_display_is_stable(
            ns in prop::collection::vec(segment(), 1..4),
            wildcard in any::<bool>(),
        ) {
            let text = if wildcard { format!("{}.*", ns.join(".")) } else { ns.join(".") };
            let pattern = ToolPattern::parse(&text).unwrap();
            prop_assert_eq!(pattern.to_string(), text);
        }
    }
}
