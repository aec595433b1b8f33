//! License aggregation: deduplication of the committed set and type-aware
//! merging of product claims.
//!
//! Deduplication keeps, per license file identifier, the most recently
//! issued license. Product aggregation walks the committed set oldest to
//! newest and folds the claims of each product together, summing numbers,
//! unioning arrays and pinning exclusive claims to the value fixed by the
//! oldest license that declared them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::claims::EXCLUSIVE_CLAIM;
use crate::scanner::ParsedLicense;

/// Observer for membership changes of the active license set.
///
/// All hooks default to no-ops; implementors pick the events they care
/// about. The same identifier fires at most one hook per scan cycle.
pub trait ActivationHooks {
    /// A license that was not active before made it into the set.
    fn on_activate(&mut self, _license: &Arc<ParsedLicense>) {}

    /// A new identifier appeared, whether or not it was deduplicated away.
    fn on_new(&mut self, _license: &Arc<ParsedLicense>) {}

    /// A previously active identifier no longer appears.
    fn on_remove(&mut self, _license: &Arc<ParsedLicense>) {}

    /// A new license was dropped because its file identifier is already
    /// taken by a newer license.
    fn on_skip(&mut self, _license: &Arc<ParsedLicense>) {}
}

/// Hook implementation that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ActivationHooks for NoHooks {}

/// Sorts candidate licenses and deduplicates them by file identifier.
///
/// Input order does not matter. The result is ordered oldest first; when
/// two licenses share a non-empty file identifier, the most recently
/// issued one survives. `activate_history` is updated to exactly the set
/// of identifiers seen in this cycle, and the delta versus the previous
/// cycle is reported through `hooks`.
pub fn sort_and_deduplicate(
    mut licenses: Vec<Arc<ParsedLicense>>,
    activate_history: &mut HashMap<String, Arc<ParsedLicense>>,
    hooks: &mut dyn ActivationHooks,
) -> Vec<Arc<ParsedLicense>> {
    // Newest first, so that the first holder of a file identifier wins.
    licenses.sort_by(|a, b| {
        b.claims
            .iat
            .unwrap_or_default()
            .cmp(&a.claims.iat.unwrap_or_default())
    });

    let mut all: HashMap<String, Arc<ParsedLicense>> = HashMap::new();
    let mut added: HashMap<String, bool> = HashMap::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut result: Vec<Arc<ParsedLicense>> = Vec::with_capacity(licenses.len());

    for license in &licenses {
        all.insert(license.license_id.clone(), license.clone());
        let is_new = if activate_history.contains_key(&license.license_id) {
            added.insert(license.license_id.clone(), false);
            false
        } else {
            added.insert(license.license_id.clone(), true);
            activate_history.insert(license.license_id.clone(), license.clone());
            true
        };

        let file_id = license.file_id();
        if file_id.is_empty() || !seen.contains(file_id) {
            if !file_id.is_empty() {
                seen.insert(file_id.to_string());
            }
            result.push(license.clone());
            if is_new {
                hooks.on_activate(license);
            }
        } else if is_new {
            hooks.on_skip(license);
        }
    }
    // The survivors were collected newest first; flip to oldest first.
    result.reverse();

    let removed: Vec<String> = activate_history
        .keys()
        .filter(|id| !added.contains_key(*id))
        .cloned()
        .collect();
    for id in removed {
        if let Some(license) = activate_history.remove(&id) {
            hooks.on_remove(&license);
        }
    }
    for (id, fresh) in &added {
        if *fresh {
            if let Some(license) = all.get(id) {
                hooks.on_new(license);
            }
        }
    }

    result
}

/// Prepends a synthetic entry carrying the globally configured subject.
#[must_use]
pub fn with_synthetic_subject(
    sub: &str,
    claims: Vec<Arc<ParsedLicense>>,
) -> Vec<Arc<ParsedLicense>> {
    let mut result = Vec::with_capacity(claims.len() + 1);
    result.push(Arc::new(ParsedLicense::synthetic_subject(sub)));
    result.extend(claims);
    result
}

/// Aggregated view of one product across all active licenses.
#[derive(Debug, Clone, Serialize)]
pub struct ProductAggregate {
    /// Whether the product is licensed at all.
    pub ok: bool,

    /// The merged claims of the product.
    pub claims: BTreeMap<String, Value>,

    /// Expiry times of every contributing license, in contribution order.
    pub expiry: Vec<Option<i64>>,

    /// Display names of the contributing licenses.
    pub dn: Vec<String>,

    /// Support identification numbers of the contributing licenses.
    pub sin: Vec<String>,

    /// Exclusive claims pinned so far, by claim name.
    #[serde(skip)]
    pub exclusive: BTreeMap<String, Value>,
}

impl Default for ProductAggregate {
    fn default() -> Self {
        Self {
            ok: true,
            claims: BTreeMap::new(),
            expiry: Vec::new(),
            dn: Vec::new(),
            sin: Vec::new(),
            exclusive: BTreeMap::new(),
        }
    }
}

/// Extracts the list of claim names a product marks as exclusive.
///
/// Returns `None` when the entry is present but not a list of strings.
fn exclusive_names(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|entry| entry.as_str().map(str::to_string))
        .collect()
}

/// Folds the product claims of the committed set, oldest to newest.
///
/// `filter`, when set, restricts the result to the named products.
#[must_use]
pub fn aggregate_products(
    claims: &[Arc<ParsedLicense>],
    filter: Option<&HashSet<String>>,
) -> BTreeMap<String, ProductAggregate> {
    let mut products: BTreeMap<String, ProductAggregate> = BTreeMap::new();

    for license in claims {
        for (name, product) in &license.claims.k.products {
            if let Some(filter) = filter {
                if !filter.contains(name) {
                    continue;
                }
            }

            let entry = products.entry(name.clone()).or_default();

            // Claims newly declared exclusive by this license; their values
            // are pinned once this license's contribution is accepted.
            let mut current_exclusive: BTreeMap<String, Option<Value>> = BTreeMap::new();
            if let Some(declared) = product.claims.get(EXCLUSIVE_CLAIM) {
                match exclusive_names(declared) {
                    Some(names) => {
                        for claim_name in names {
                            current_exclusive.insert(claim_name, None);
                        }
                    }
                    None => {
                        debug!(
                            product = %name,
                            name = %license.path.display(),
                            "unknown exclusive claims format, skipping all related claims"
                        );
                        continue;
                    }
                }
            }

            let mut aggregate = true;
            for (key, next_value) in &product.claims {
                if key == EXCLUSIVE_CLAIM {
                    continue;
                }
                if let Some(pinned) = entry.exclusive.get(key) {
                    if next_value != pinned {
                        warn!(
                            product = %name,
                            claim = %key,
                            name = %license.path.display(),
                            "conflict of exclusive claim, any older license with a conflicting value of this claim must be removed before this license can be used"
                        );
                        aggregate = false;
                    }
                    continue;
                }
                if let Some(slot) = current_exclusive.get_mut(key) {
                    *slot = Some(next_value.clone());
                }
            }
            if !aggregate {
                debug!(product = %name, name = %license.path.display(), "skipping claim value aggregation");
                continue;
            }

            for (key, next_value) in &product.claims {
                if key == EXCLUSIVE_CLAIM {
                    continue;
                }
                merge_claim(entry, name, key, next_value, license);
            }

            entry.expiry.push(license.claims.exp);
            if !license.claims.dn.is_empty() {
                append_if_missing(&mut entry.dn, &license.claims.dn);
            }
            if !license.claims.sin.is_empty() {
                append_if_missing(&mut entry.sin, &license.claims.sin);
            }
            for (key, value) in current_exclusive {
                if let Some(value) = value {
                    entry.exclusive.insert(key, value);
                }
            }
        }
    }

    products
}

/// Merges one incoming claim value into the aggregate, dispatching on its
/// observed type. Contributions arrive oldest to newest, so on a type
/// mismatch the newer value wins.
fn merge_claim(
    entry: &mut ProductAggregate,
    product: &str,
    key: &str,
    next_value: &Value,
    license: &ParsedLicense,
) {
    let have_value = match entry.claims.entry(key.to_string()) {
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(next_value.clone());
            return;
        }
        std::collections::btree_map::Entry::Occupied(slot) => slot.into_mut(),
    };

    match next_value {
        Value::Number(number) if number.is_i64() => {
            let next = number.as_i64().unwrap_or_default();
            if let Some(have) = have_value.as_i64().filter(|_| have_value.is_i64()) {
                *have_value = Value::from(have.saturating_add(next));
            } else {
                debug!(product = %product, claim = %key, name = %license.path.display(),
                    "integer type mismatch in claim, using newest");
                *have_value = next_value.clone();
            }
        }
        Value::Number(number) => {
            let next = number.as_f64().unwrap_or_default();
            if let Some(have) = have_value.as_f64().filter(|_| have_value.is_f64()) {
                *have_value = Value::from(have + next);
            } else {
                debug!(product = %product, claim = %key, name = %license.path.display(),
                    "float type mismatch in claim, using newest");
                *have_value = next_value.clone();
            }
        }
        Value::Array(next) => {
            if let Value::Array(have) = have_value {
                for element in next {
                    if !have.contains(element) {
                        have.push(element.clone());
                    }
                }
            } else {
                debug!(product = %product, claim = %key, name = %license.path.display(),
                    "array type mismatch in claim, using newest");
                *have_value = next_value.clone();
            }
        }
        _ => {
            if have_value != next_value {
                debug!(product = %product, claim = %key, name = %license.path.display(),
                    "mismatch in claim value, using newest");
                *have_value = next_value.clone();
            }
        }
    }
}

fn append_if_missing(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|existing| existing == value) {
        list.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{Claims, Product, ProductContainer};
    use serde_json::json;
    use std::path::PathBuf;

    fn license(
        license_id: &str,
        uid: &str,
        iat: i64,
        products: &[(&str, serde_json::Value)],
    ) -> Arc<ParsedLicense> {
        let mut set = BTreeMap::new();
        for (name, value) in products {
            let product: Product = serde_json::from_value(value.clone()).unwrap();
            set.insert((*name).to_string(), product);
        }
        Arc::new(ParsedLicense {
            path: PathBuf::from(format!("/licenses/{license_id}")),
            raw: String::new(),
            claims: Claims {
                sub: Some("cust-A".into()),
                iat: Some(iat),
                exp: Some(2_000_000_000),
                uid: uid.to_string(),
                k: ProductContainer {
                    v: 0,
                    products: set,
                },
                ..Claims::default()
            },
            license_id: license_id.to_string(),
        })
    }

    #[derive(Default)]
    struct RecordingHooks {
        activated: Vec<String>,
        new: Vec<String>,
        removed: Vec<String>,
        skipped: Vec<String>,
    }

    impl ActivationHooks for RecordingHooks {
        fn on_activate(&mut self, license: &Arc<ParsedLicense>) {
            self.activated.push(license.license_id.clone());
        }
        fn on_new(&mut self, license: &Arc<ParsedLicense>) {
            self.new.push(license.license_id.clone());
        }
        fn on_remove(&mut self, license: &Arc<ParsedLicense>) {
            self.removed.push(license.license_id.clone());
        }
        fn on_skip(&mut self, license: &Arc<ParsedLicense>) {
            self.skipped.push(license.license_id.clone());
        }
    }

    #[test]
    fn newer_license_wins_file_id_dedup() {
        let older = license("j-old", "u-1", 100, &[]);
        let newer = license("j-new", "u-1", 200, &[]);
        let mut history = HashMap::new();
        let mut hooks = RecordingHooks::default();

        let result = sort_and_deduplicate(vec![older, newer], &mut history, &mut hooks);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].license_id, "j-new");
        assert_eq!(hooks.activated, vec!["j-new"]);
        assert_eq!(hooks.skipped, vec!["j-old"]);
        // Both identifiers are tracked even though only one is active.
        assert!(history.contains_key("j-new"));
        assert!(history.contains_key("j-old"));
    }

    #[test]
    fn result_is_ordered_oldest_first() {
        let a = license("j-a", "u-a", 300, &[]);
        let b = license("j-b", "u-b", 100, &[]);
        let c = license("j-c", "u-c", 200, &[]);
        let mut history = HashMap::new();

        let result = sort_and_deduplicate(vec![a, b, c], &mut history, &mut NoHooks);

        let order: Vec<&str> = result.iter().map(|l| l.license_id.as_str()).collect();
        assert_eq!(order, vec!["j-b", "j-c", "j-a"]);
    }

    #[test]
    fn empty_file_ids_never_collide() {
        let a = license("j-a", "", 100, &[]);
        let b = license("j-b", "", 200, &[]);
        let mut history = HashMap::new();

        let result = sort_and_deduplicate(vec![a, b], &mut history, &mut NoHooks);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn membership_delta_fires_remove_and_settles() {
        let a = license("j-a", "u-a", 100, &[]);
        let b = license("j-b", "u-b", 200, &[]);
        let mut history = HashMap::new();

        sort_and_deduplicate(vec![a.clone(), b], &mut history, &mut NoHooks);

        // Next cycle only sees one of the two.
        let mut hooks = RecordingHooks::default();
        sort_and_deduplicate(vec![a.clone()], &mut history, &mut hooks);
        assert_eq!(hooks.removed, vec!["j-b"]);
        assert!(hooks.new.is_empty());
        assert!(!history.contains_key("j-b"));

        // A further unchanged cycle fires nothing.
        let mut quiet = RecordingHooks::default();
        sort_and_deduplicate(vec![a], &mut history, &mut quiet);
        assert!(quiet.new.is_empty());
        assert!(quiet.removed.is_empty());
        assert!(quiet.activated.is_empty());
        assert!(quiet.skipped.is_empty());
    }

    #[test]
    fn synthetic_subject_is_prepended() {
        let a = license("j-a", "u-a", 100, &[]);
        let result = with_synthetic_subject("deadbeef", vec![a]);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].claims.sub.as_deref(), Some("deadbeef"));
        assert_eq!(result[0].license_id, "");
        assert_eq!(result[1].license_id, "j-a");
    }

    #[test]
    fn integer_claims_are_summed() {
        let a = license("j-a", "u-a", 100, &[("x", json!({"lid": "l-1", "users": 5}))]);
        let b = license("j-b", "u-b", 200, &[("x", json!({"lid": "l-2", "users": 7}))]);

        let products = aggregate_products(&[a, b], None);
        let x = &products["x"];
        assert!(x.ok);
        assert_eq!(x.claims["users"], json!(12));
        assert_eq!(x.expiry.len(), 2);
    }

    #[test]
    fn float_claims_are_summed() {
        let a = license("j-a", "u-a", 100, &[("x", json!({"rate": 1.5}))]);
        let b = license("j-b", "u-b", 200, &[("x", json!({"rate": 2.25}))]);

        let products = aggregate_products(&[a, b], None);
        assert_eq!(products["x"].claims["rate"], json!(3.75));
    }

    #[test]
    fn numeric_type_mismatch_uses_newest() {
        let a = license("j-a", "u-a", 100, &[("x", json!({"users": 5}))]);
        let b = license("j-b", "u-b", 200, &[("x", json!({"users": 2.5}))]);

        let products = aggregate_products(&[a, b], None);
        assert_eq!(products["x"].claims["users"], json!(2.5));
    }

    #[test]
    fn array_claims_union_in_first_appearance_order() {
        let a = license("j-a", "u-a", 100, &[("x", json!({"features": ["a", "b"]}))]);
        let b = license("j-b", "u-b", 200, &[("x", json!({"features": ["b", "c"]}))]);

        let products = aggregate_products(&[a, b], None);
        assert_eq!(products["x"].claims["features"], json!(["a", "b", "c"]));
    }

    #[test]
    fn scalar_mismatch_replaces_with_newest() {
        let a = license("j-a", "u-a", 100, &[("x", json!({"edition": "basic"}))]);
        let b = license("j-b", "u-b", 200, &[("x", json!({"edition": "pro"}))]);

        let products = aggregate_products(&[a, b], None);
        assert_eq!(products["x"].claims["edition"], json!("pro"));
    }

    #[test]
    fn exclusive_conflict_drops_whole_contribution() {
        let a = license(
            "j-a",
            "u-a",
            100,
            &[(
                "x",
                json!({"multitenant": true, "exclusive": ["multitenant"]}),
            )],
        );
        let b = license(
            "j-b",
            "u-b",
            200,
            &[("x", json!({"multitenant": false, "users": 10}))],
        );

        let products = aggregate_products(&[a, b], None);
        let x = &products["x"];
        assert_eq!(x.claims["multitenant"], json!(true));
        assert!(
            !x.claims.contains_key("users"),
            "conflicting license must not contribute anything"
        );
        assert_eq!(x.expiry.len(), 1);
    }

    #[test]
    fn exclusive_agreement_still_aggregates() {
        let a = license(
            "j-a",
            "u-a",
            100,
            &[(
                "x",
                json!({"multitenant": true, "users": 5, "exclusive": ["multitenant"]}),
            )],
        );
        let b = license(
            "j-b",
            "u-b",
            200,
            &[("x", json!({"multitenant": true, "users": 10}))],
        );

        let products = aggregate_products(&[a, b], None);
        let x = &products["x"];
        assert_eq!(x.claims["multitenant"], json!(true));
        assert_eq!(x.claims["users"], json!(15));
    }

    #[test]
    fn exclusive_is_never_merged_as_data() {
        let a = license(
            "j-a",
            "u-a",
            100,
            &[("x", json!({"multitenant": true, "exclusive": ["multitenant"]}))],
        );
        let products = aggregate_products(&[a], None);
        assert!(!products["x"].claims.contains_key(EXCLUSIVE_CLAIM));
    }

    #[test]
    fn product_filter_limits_output() {
        let a = license(
            "j-a",
            "u-a",
            100,
            &[("x", json!({"users": 5})), ("y", json!({"users": 3}))],
        );
        let filter: HashSet<String> = ["y".to_string()].into();

        let products = aggregate_products(&[a], Some(&filter));
        assert!(!products.contains_key("x"));
        assert!(products.contains_key("y"));
    }

    #[test]
    fn display_names_and_support_ids_deduplicate() {
        let mut a = license("j-a", "u-a", 100, &[("x", json!({}))]);
        let mut b = license("j-b", "u-b", 200, &[("x", json!({}))]);
        Arc::get_mut(&mut a).unwrap().claims.dn = "Customer A".into();
        Arc::get_mut(&mut a).unwrap().claims.sin = "123".into();
        Arc::get_mut(&mut b).unwrap().claims.dn = "Customer A".into();
        Arc::get_mut(&mut b).unwrap().claims.sin = "456".into();

        let products = aggregate_products(&[a, b], None);
        let x = &products["x"];
        assert_eq!(x.dn, vec!["Customer A"]);
        assert_eq!(x.sin, vec!["123", "456"]);
    }

    #[test]
    fn aggregate_serializes_expected_shape() {
        let a = license("j-a", "u-a", 100, &[("x", json!({"users": 5}))]);
        let products = aggregate_products(&[a], None);
        let value = serde_json::to_value(&products["x"]).unwrap();
        assert_eq!(
            value,
            json!({
                "ok": true,
                "claims": {"users": 5},
                "expiry": [2_000_000_000],
                "dn": [],
                "sin": [],
            })
        );
    }
}
