use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::debug;

use super::compiled::{CompiledConstraint, CompiledConstraintSet, Origin};
use super::constraint::{Constraint, Phase};
use crate::capability::CapabilityToken;
use crate::error::WardenError;
use crate::schema::{ParamType, ToolSchema};

type CacheKey = (String, String);

/// Compiled sets kept by a default compiler.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Capped map; a full cache evicts its least recently used entry.
#[derive(Debug, Default)]
struct SetCache {
    entries: HashMap<CacheKey, (u64, Arc<CompiledConstraintSet>)>,
    clock: u64,
}

impl SetCache {
    fn get(&mut self, key: &CacheKey) -> Option<Arc<CompiledConstraintSet>> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|(used, set)| {
            *used = clock;
            set.clone()
        })
    }

    fn insert(&mut self, key: CacheKey, set: Arc<CompiledConstraintSet>, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.clock += 1;
        self.entries.insert(key, (self.clock, set));
    }
}

/// Turns a tool schema plus the caller's capability tokens into the
/// ordered constraint set the guard enforces.
///
/// Compilation is deterministic, so results are cached by schema
/// fingerprint and the signatures of the tokens that matched. The
/// compiler can be shared across sessions; its cache is capped.
#[derive(Debug)]
pub struct ConstraintCompiler {
    cache: Mutex<SetCache>,
    capacity: usize,
}

impl Default for ConstraintCompiler {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl ConstraintCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A compiler caching at most `capacity` sets; 0 disables caching.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(SetCache::default()),
            capacity,
        }
    }

    /// Compiles `schema` against every token whose pattern matches its
    /// name. Fails with `NoMatchingCapability` when none does.
    ///
    /// Emission order:
    /// 1. per parameter, in schema order: presence, type, pattern, bounds
    /// 2. required response fields as response-phase presence checks,
    ///    except fields some matching token excludes
    /// 3. each matching token's constraints, tokens in supplied order
    pub fn compile(
        &self,
        schema: &ToolSchema,
        tokens: &[Arc<CapabilityToken>],
    ) -> Result<Arc<CompiledConstraintSet>, WardenError> {
        let matching: Vec<&CapabilityToken> = tokens
            .iter()
            .map(Arc::as_ref)
            .filter(|t| t.pattern.matches(&schema.name))
            .collect();
        if matching.is_empty() {
            return Err(WardenError::NoMatchingCapability {
                tool: schema.name.clone(),
            });
        }

        let key = (schema.fingerprint(), token_set_digest(&matching));
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Ok(hit);
            }
        }

        let set = Arc::new(build(schema, &matching, key.0.clone())?);
        debug!(
            "Compiled {} pre / {} post constraint(s) for {} from {} token(s)",
            set.pre.len(),
            set.post.len(),
            set.tool,
            matching.len()
        );

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, set.clone(), self.capacity);
        }
        Ok(set)
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().map(|c| c.entries.len()).unwrap_or(0)
    }
}

fn token_set_digest(tokens: &[&CapabilityToken]) -> String {
    let mut hasher = Sha256::new();
    for t in tokens {
        hasher.update(t.id.as_bytes());
        hasher.update([0]);
        hasher.update(t.signature.as_bytes());
        hasher.update([0]);
    }
    hex::encode(hasher.finalize())
}

fn build(
    schema: &ToolSchema,
    tokens: &[&CapabilityToken],
    fingerprint: String,
) -> Result<CompiledConstraintSet, WardenError> {
    let mut pre = Vec::new();
    let mut post = Vec::new();
    let from_schema = |c: Constraint| CompiledConstraint::new(c, Origin::Schema);

    for p in &schema.parameters {
        if p.required {
            pre.push(from_schema(Constraint::FieldPresence {
                field: p.name.clone(),
                phase: Phase::Arguments,
            })?);
        }
        if p.param_type != ParamType::Any {
            pre.push(from_schema(Constraint::FieldType {
                field: p.name.clone(),
                expected: p.param_type,
            })?);
        }
        if let Some(ref regex) = p.pattern {
            pre.push(from_schema(Constraint::FieldPattern {
                field: p.name.clone(),
                regex: regex.clone(),
            })?);
        }
        if let Some(b) = p.bounds {
            pre.push(from_schema(Constraint::ValueBound {
                field: p.name.clone(),
                min: b.min,
                max: b.max,
            })?);
        }
    }

    // A field a token redacts is never also required in the response.
    let excluded: Vec<&str> = tokens
        .iter()
        .flat_map(|t| t.constraints.iter())
        .filter_map(|c| match c {
            Constraint::FieldExclusion { fields } => Some(fields.iter().map(String::as_str)),
            _ => None,
        })
        .flatten()
        .collect();
    let is_excluded = |field: &str| {
        excluded.iter().any(|e| {
            field == *e || field.starts_with(&format!("{e}.")) || e.starts_with(&format!("{field}."))
        })
    };

    for f in schema.response.fields.iter().filter(|f| f.required) {
        if is_excluded(&f.name) {
            debug!(
                "{}: response field '{}' is both required and excluded, exclusion wins",
                schema.name, f.name
            );
            continue;
        }
        post.push(from_schema(Constraint::FieldPresence {
            field: f.name.clone(),
            phase: Phase::Response,
        })?);
    }

    for token in tokens {
        for c in &token.constraints {
            // Response-phase presence on an excluded field is dropped too.
            if let Constraint::FieldPresence {
                field,
                phase: Phase::Response,
            } = c
            {
                if is_excluded(field) {
                    continue;
                }
            }
            let compiled = CompiledConstraint::new(c.clone(), Origin::Token(token.id.clone()))?;
            match compiled.phase() {
                Phase::Arguments => pre.push(compiled),
                Phase::Response => post.push(compiled),
            }
        }
    }

    Ok(CompiledConstraintSet {
        tool: schema.name.clone(),
        fingerprint,
        operation: schema.operation().to_string(),
        tokens: tokens.iter().map(|t| t.id.clone()).collect(),
        pre,
        post,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ToolPattern;
    use crate::policy::semantic::DenyAllVerifier;
    use crate::policy::{CheckEnv, PolicyContext};
    use chrono::{Duration as ChronoDuration, Utc};
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn lead_schema() -> ToolSchema {
        serde_json::from_value(json!({
            "name": "salesforce.read.getLead",
            "parameters": [
                {"name": "recordId", "type": "string", "required": true,
                 "pattern": "^00Q[a-zA-Z0-9]{15}$"},
                {"name": "limit", "type": "integer", "bounds": {"min": 1, "max": 100}}
            ],
            "response": {"fields": [
                {"name": "Id", "type": "string", "required": true},
                {"name": "Email", "type": "string", "required": true}
            ]}
        }))
        .unwrap()
    }

    fn token(id: &str, pattern: &str, constraints: Vec<Constraint>) -> Arc<CapabilityToken> {
        Arc::new(CapabilityToken {
            id: id.into(),
            pattern: ToolPattern::parse(pattern).unwrap(),
            operations: BTreeSet::from(["read".to_string()]),
            constraints,
            issuer: "authority".into(),
            expires_at: Utc::now() + ChronoDuration::days(1),
            signature: format!("sig-{id}"),
        })
    }

    #[test]
    fn test_no_matching_token_fails_closed() {
        let compiler = ConstraintCompiler::new();
        let err = compiler
            .compile(&lead_schema(), &[token("t1", "salesforce.write.*", vec![])])
            .unwrap_err();
        assert!(matches!(err, WardenError::NoMatchingCapability { .. }));
        let err = compiler.compile(&lead_schema(), &[]).unwrap_err();
        assert!(matches!(err, WardenError::NoMatchingCapability { .. }));
    }

    #[test]
    fn test_emission_order() {
        let compiler = ConstraintCompiler::new();
        let tokens = [
            token(
                "t1",
                "salesforce.read.*",
                vec![
                    Constraint::ValueBound {
                        field: "limit".into(),
                        min: None,
                        max: Some(50.0),
                    },
                    Constraint::FieldExclusion {
                        fields: vec!["ssn".into()],
                    },
                ],
            ),
            token(
                "t2",
                "salesforce.read.getLead",
                vec![Constraint::ScopeRestriction {
                    predicate: "has(recordId)".into(),
                }],
            ),
            token("other", "jira.*", vec![]),
        ];
        let set = compiler.compile(&lead_schema(), &tokens).unwrap();
        let pre: Vec<String> = set.pre.iter().map(|c| c.describe()).collect();
        assert_eq!(
            pre,
            vec![
                "field_presence(recordId)",
                "field_type(recordId: string)",
                "field_pattern(recordId ~ /^00Q[a-zA-Z0-9]{15}$/)",
                "field_type(limit: integer)",
                "value_bound(limit in [1, 100])",
                "value_bound(limit in <= 50)",
                "scope_restriction(has(recordId))",
            ]
        );
        let post: Vec<String> = set.post.iter().map(|c| c.describe()).collect();
        assert_eq!(
            post,
            vec![
                "field_presence(response.Id)",
                "field_presence(response.Email)",
                "field_exclusion(ssn)",
            ]
        );
        assert_eq!(set.tokens, vec!["t1", "t2"]);
        assert_eq!(set.pre[6].origin, Origin::Token("t2".into()));
    }

    #[test]
    fn test_exclusion_wins_over_response_requirement() {
        let compiler = ConstraintCompiler::new();
        let tokens = [
            token(
                "redact",
                "salesforce.read.*",
                vec![Constraint::FieldExclusion {
                    fields: vec!["Email".into()],
                }],
            ),
            token(
                "require",
                "salesforce.read.*",
                vec![Constraint::FieldPresence {
                    field: "Email".into(),
                    phase: Phase::Response,
                }],
            ),
        ];
        let set = compiler.compile(&lead_schema(), &tokens).unwrap();
        let post: Vec<String> = set.post.iter().map(|c| c.describe()).collect();
        assert_eq!(post, vec!["field_presence(response.Id)", "field_exclusion(Email)"]);
    }

    #[test]
    fn test_malformed_token_regex() {
        let compiler = ConstraintCompiler::new();
        let tokens = [token(
            "t1",
            "salesforce.*",
            vec![Constraint::FieldPattern {
                field: "recordId".into(),
                regex: "(unclosed".into(),
            }],
        )];
        let err = compiler.compile(&lead_schema(), &tokens).unwrap_err();
        assert!(matches!(err, WardenError::MalformedPolicy { .. }));
        assert_eq!(compiler.cached(), 0);
    }

    #[test]
    fn test_cache_hits_share_the_set() {
        let compiler = ConstraintCompiler::new();
        let tokens = [token("t1", "salesforce.read.*", vec![])];
        let a = compiler.compile(&lead_schema(), &tokens).unwrap();
        let b = compiler.compile(&lead_schema(), &tokens).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(compiler.cached(), 1);

        let other = [token("t2", "salesforce.read.*", vec![])];
        let c = compiler.compile(&lead_schema(), &other).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(compiler.cached(), 2);
    }

    #[test]
    fn test_cache_is_capped_and_evicts_least_recently_used() {
        let compiler = ConstraintCompiler::with_capacity(2);
        let t1 = [token("t1", "salesforce.read.*", vec![])];
        let t2 = [token("t2", "salesforce.read.*", vec![])];
        let t3 = [token("t3", "salesforce.read.*", vec![])];

        let first = compiler.compile(&lead_schema(), &t1).unwrap();
        compiler.compile(&lead_schema(), &t2).unwrap();
        // Touch t1 so t2 becomes the oldest entry.
        assert!(Arc::ptr_eq(&first, &compiler.compile(&lead_schema(), &t1).unwrap()));
        compiler.compile(&lead_schema(), &t3).unwrap();
        assert_eq!(compiler.cached(), 2);
        assert!(Arc::ptr_eq(&first, &compiler.compile(&lead_schema(), &t1).unwrap()));

        for i in 0..50 {
            let t = [token(&format!("extra{i}"), "salesforce.read.*", vec![])];
            compiler.compile(&lead_schema(), &t).unwrap();
        }
        assert_eq!(compiler.cached(), 2);
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let compiler = ConstraintCompiler::with_capacity(0);
        let tokens = [token("t1", "salesforce.read.*", vec![])];
        let a = compiler.compile(&lead_schema(), &tokens).unwrap();
        let b = compiler.compile(&lead_schema(), &tokens).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.pre.len(), b.pre.len());
        assert_eq!(compiler.cached(), 0);
    }

    // ── Properties ─────────────────────────────────────

    fn segment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("salesforce".to_string()),
            Just("read".to_string()),
            Just("write".to_string()),
            Just("getLead".to_string()),
            "[a-z]{1,4}",
        ]
    }

    fn pattern() -> impl Strategy<Value = String> {
        (prop::collection::vec(segment(), 1..4), any::<bool>()).prop_map(|(segs, wildcard)| {
            if wildcard {
                format!("{}.*", segs.join("."))
            } else {
                segs.join(".")
            }
        })
    }

    fn token_constraint() -> impl Strategy<Value = Constraint> {
        prop_oneof![
            (0.0f64..200.0).prop_map(|max| Constraint::ValueBound {
                field: "limit".into(),
                min: None,
                max: Some(max),
            }),
            Just(Constraint::FieldPresence {
                field: "owner".into(),
                phase: Phase::Arguments,
            }),
            Just(Constraint::FieldPattern {
                field: "recordId".into(),
                regex: "AAA$".into(),
            }),
            Just(Constraint::ScopeRestriction {
                predicate: "limit != 7".into(),
            }),
        ]
    }

    fn args() -> impl Strategy<Value = Value> {
        (
            prop::option::of(prop_oneof![
                Just(json!("00Q000000000000AAA")),
                Just(json!("bad")),
                Just(json!(5)),
            ]),
            prop::option::of(prop_oneof![(-5i64..150).prop_map(Value::from), Just(json!("x"))]),
            prop::option::of(Just(json!("user-1"))),
        )
            .prop_map(|(record, limit, owner)| {
                let mut m = serde_json::Map::new();
                if let Some(r) = record {
                    m.insert("recordId".into(), r);
                }
                if let Some(l) = limit {
                    m.insert("limit".into(), l);
                }
                if let Some(o) = owner {
                    m.insert("owner".into(), o);
                }
                Value::Object(m)
            })
    }

    fn check(set: &CompiledConstraintSet, args: &Value) -> bool {
        let ctx = PolicyContext::default();
        let env = CheckEnv {
            tool: &set.tool,
            ctx: &ctx,
            verifier: &DenyAllVerifier,
            semantic_timeout: Duration::from_millis(50),
        };
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(set.check_arguments(args, &env)).is_ok()
    }

    proptest! {
        #[test]
        fn no_matching_capability_iff_no_pattern_matches(
            patterns in prop::collection::vec(pattern(), 0..5)
        ) {
            let schema = lead_schema();
            let tokens: Vec<_> = patterns
                .iter()
                .enumerate()
                .map(|(i, p)| token(&format!("t{i}"), p, vec![]))
                .collect();
            let any_match = tokens.iter().any(|t| t.pattern.matches(&schema.name));
            let result = ConstraintCompiler::new().compile(&schema, &tokens);
            let no_match = matches!(result, Err(WardenError::NoMatchingCapability { .. }));
            prop_assert_eq!(no_match, !any_match);
        }

        #[test]
        fn token_constraints_only_narrow(
            constraints in prop::collection::vec(token_constraint(), 0..4),
            args in args(),
        ) {
            let compiler = ConstraintCompiler::new();
            let schema = lead_schema();
            let base = compiler
                .compile(&schema, &[token("base", "salesforce.read.*", vec![])])
                .unwrap();
            let narrowed = compiler
                .compile(&schema, &[token("narrow", "salesforce.read.*", constraints)])
                .unwrap();
            // Whatever the schema-only set rejects, the narrowed set rejects too.
            if !check(&base, &args) {
                prop_assert!(!check(&narrowed, &args));
            }
        }
    }
}
