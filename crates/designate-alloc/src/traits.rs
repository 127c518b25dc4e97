//! Trait matching between what a provision asks for and what a server
//! offers.
//!
//! A server only accepts provisions that name exactly its trait set, so
//! servers tagged for a purpose are never handed to unrelated workloads.

use designate_core::{AllocationRequest, TraitValue, Traits};

/// Merge package, VM and image traits into the requested set.
///
/// Later sources win on conflict: package < VM < image.
pub fn requested_traits(request: &AllocationRequest) -> Traits {
    let mut traits = request
        .package
        .as_ref()
        .map(|p| p.traits.clone())
        .unwrap_or_default();
    traits.extend(request.vm.traits.clone());
    traits.extend(request.image.traits.clone());
    traits
}

/// Check a server's traits against the requested ones.
///
/// Returns the first mismatch as an error message.
pub fn match_traits(requested: &Traits, offered: &Traits) -> Result<(), String> {
    if let Some(extra) = offered.keys().find(|k| !requested.contains_key(*k)) {
        return Err(format!("server trait {extra:?} was not requested"));
    }

    for (name, want) in requested {
        let Some(have) = offered.get(name) else {
            return Err(format!("server lacks trait {name:?}"));
        };
        if !value_matches(want, have) {
            return Err(format!(
                "trait {name:?}: requested {} does not match server {}",
                describe(want),
                describe(have)
            ));
        }
    }
    Ok(())
}

fn value_matches(want: &TraitValue, have: &TraitValue) -> bool {
    match (want, have) {
        (TraitValue::Bool(w), TraitValue::Bool(h)) => w == h,
        (TraitValue::String(w), TraitValue::String(h)) => w == h,
        (TraitValue::String(w), TraitValue::List(h)) => h.contains(w),
        (TraitValue::List(w), TraitValue::String(h)) => w.contains(h),
        (TraitValue::List(w), TraitValue::List(h)) => w.iter().any(|v| h.contains(v)),
        _ => false,
    }
}

fn describe(value: &TraitValue) -> String {
    match value {
        TraitValue::Bool(b) => b.to_string(),
        TraitValue::String(s) => format!("{s:?}"),
        TraitValue::List(l) => format!("{l:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use designate_core::{Image, Package, Vm};

    fn traits(json: &str) -> Traits {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn extra_server_trait_fails() {
        let requested = traits(r#"{"ssd": true}"#);
        let offered = traits(r#"{"ssd": true, "users": "john"}"#);
        assert!(match_traits(&requested, &offered).is_err());
    }

    #[test]
    fn empty_matches_traitless_only() {
        assert!(match_traits(&Traits::new(), &Traits::new()).is_ok());
        assert!(match_traits(&Traits::new(), &traits(r#"{"ssd": true}"#)).is_err());
        assert!(match_traits(&traits(r#"{"ssd": true}"#), &Traits::new()).is_err());
    }

    #[test]
    fn booleans_must_be_equal() {
        assert!(match_traits(&traits(r#"{"ssd": true}"#), &traits(r#"{"ssd": true}"#)).is_ok());
        assert!(match_traits(&traits(r#"{"ssd": false}"#), &traits(r#"{"ssd": true}"#)).is_err());
    }

    #[test]
    fn string_matches_string_or_list_member() {
        let requested = traits(r#"{"users": "john"}"#);
        assert!(match_traits(&requested, &traits(r#"{"users": "john"}"#)).is_ok());
        assert!(match_traits(&requested, &traits(r#"{"users": ["mary", "john"]}"#)).is_ok());
        assert!(match_traits(&requested, &traits(r#"{"users": ["mary"]}"#)).is_err());
        assert!(match_traits(&requested, &traits(r#"{"users": "mary"}"#)).is_err());
    }

    #[test]
    fn list_must_intersect() {
        let requested = traits(r#"{"users": ["john", "mary"]}"#);
        assert!(match_traits(&requested, &traits(r#"{"users": "mary"}"#)).is_ok());
        assert!(match_traits(&requested, &traits(r#"{"users": ["bob", "john"]}"#)).is_ok());
        assert!(match_traits(&requested, &traits(r#"{"users": ["bob"]}"#)).is_err());
    }

    #[test]
    fn mixed_kinds_do_not_match() {
        assert!(match_traits(&traits(r#"{"ssd": "true"}"#), &traits(r#"{"ssd": true}"#)).is_err());
        assert!(match_traits(&traits(r#"{"ssd": true}"#), &traits(r#"{"ssd": ["true"]}"#)).is_err());
    }

    #[test]
    fn image_traits_win() {
        let request = AllocationRequest {
            vm: Vm {
                uuid: "v1".into(),
                traits: traits(r#"{"ssd": false, "tier": "gold"}"#),
                ..Vm::default()
            },
            package: Some(Package {
                uuid: "p1".into(),
                traits: traits(r#"{"tier": "silver", "hw": "x"}"#),
                ..Package::default()
            }),
            image: Image {
                uuid: "i1".into(),
                traits: traits(r#"{"ssd": true}"#),
                ..Image::default()
            },
            ..AllocationRequest::default()
        };
        assert_eq!(
            requested_traits(&request),
            traits(r#"{"ssd": true, "tier": "gold", "hw": "x"}"#)
        );
    }
}
