//! Property-based tests for core engine components using proptest.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use guardbench_core::config::WeightsConfig;
use guardbench_core::guardrails::rules::{
    dedup_candidates, jaccard, normalise_rule, tokenize, Candidate, IMPERATIVE_OPENERS,
};
use guardbench_core::judge::combine_judges;
use guardbench_core::parser::{ParsedPass, PassOutcome};
use guardbench_core::registry::CriteriaRegistry;
use guardbench_core::weights::WeightingAggregator;

// --- Shared registry fixture ---

static FIXTURE: OnceLock<(tempfile::TempDir, CriteriaRegistry)> = OnceLock::new();

fn registry() -> &'static CriteriaRegistry {
    let (_, registry) = FIXTURE.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let rubric_root = dir.path().join("criteria");
        let rubric = r#"
role: "Evaluator."
task: "Score."
age_context: "Aged {age_group}."
scoring_guide: "0..5."
output_format: "JSON."
"#;
        let entries = [
            ("safety", "sexual", "sexual_content"),
            ("safety", "sexual", "sensual_manipulation"),
            ("safety", "violence", "graphic_violence"),
            ("anthropomorphism", "parasocial_bonds", "persona_projection"),
            ("age", "readability", "vocabulary"),
            ("ethics", "honesty", "ai_disclosure"),
        ];
        let mut manifest = String::from("criteria:\n");
        for (category, subcategory, name) in entries {
            let rel = format!("{category}/{subcategory}/{name}.prompt");
            let path = rubric_root.join(&rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, rubric).unwrap();
            manifest.push_str(&format!(
                "  {category}.{subcategory}.{name}__v1_0:\n    category: {category}\n    subcategory: {subcategory}\n    name: {name}\n    version: \"1.0\"\n    file: {rel}\n"
            ));
        }
        manifest.push_str(
            "presets:\n  everything:\n    description: all\n    criteria:\n",
        );
        for (category, subcategory, name) in entries {
            manifest.push_str(&format!("      - {category}.{subcategory}.{name}__v1_0\n"));
        }
        let manifest_path = dir.path().join("registry.yml");
        std::fs::write(&manifest_path, manifest).unwrap();
        let registry = CriteriaRegistry::load(&manifest_path, &rubric_root).unwrap();
        (dir, registry)
    });
    registry
}

fn selection_token() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("safety".to_string()),
        Just("age".to_string()),
        Just("ethics".to_string()),
        Just("anthropomorphism".to_string()),
        Just("safety.sexual".to_string()),
        Just("safety.violence".to_string()),
        Just("safety.sexual.sexual_content__v1_0".to_string()),
        Just("ethics.honesty.ai_disclosure__v1_0".to_string()),
        Just("everything".to_string()),
    ]
}

// --- Selection resolution properties ---

proptest! {
    #[test]
    fn selection_is_ordered_and_duplicate_free(
        tokens in prop::collection::vec(selection_token(), 1..6)
    ) {
        let expression = tokens.join(",");
        let resolved = registry().resolve_selection(&expression);
        // A preset name inside a comma list is not a preset lookup; it may
        // legitimately match nothing and error. Single tokens always match.
        if let Ok(ids) = resolved {
            let mut seen = std::collections::HashSet::new();
            for id in &ids {
                prop_assert!(seen.insert(id.clone()), "duplicate id {id}");
                prop_assert!(registry().get(id).is_some(), "unknown id {id}");
            }
        }
    }

    #[test]
    fn selection_is_deterministic(
        tokens in prop::collection::vec(selection_token(), 1..6)
    ) {
        let expression = tokens.join(",");
        let a = registry().resolve_selection(&expression).ok();
        let b = registry().resolve_selection(&expression).ok();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn single_category_tokens_always_resolve(token in selection_token()) {
        let ids = registry().resolve_selection(&token);
        prop_assert!(ids.is_ok());
        prop_assert!(!ids.unwrap().is_empty());
    }
}

// --- Weighting properties ---

fn criterion_result(id: &str, score: f64) -> guardbench_core::CriterionResult {
    let mut result = combine_judges(id, Vec::new());
    result.final_score = score;
    result.partial = false;
    result.failed = false;
    result
}

proptest! {
    #[test]
    fn aggregation_preserves_score_bounds(
        scores in prop::collection::vec(0.0f64..=5.0, 1..6),
        weights in prop::collection::btree_map(
            prop_oneof![
                Just("safety".to_string()),
                Just("age".to_string()),
                Just("ethics".to_string()),
            ],
            0.0f64..10.0,
            0..3,
        ),
    ) {
        let ids = [
            "safety.sexual.sexual_content__v1_0",
            "safety.violence.graphic_violence__v1_0",
            "age.readability.vocabulary__v1_0",
            "ethics.honesty.ai_disclosure__v1_0",
            "anthropomorphism.parasocial_bonds.persona_projection__v1_0",
            "safety.sexual.sensual_manipulation__v1_0",
        ];
        let results: Vec<_> = scores
            .iter()
            .enumerate()
            .map(|(i, &s)| criterion_result(ids[i], s))
            .collect();

        let config = WeightsConfig {
            categories: weights,
            subcategories: BTreeMap::new(),
            criteria: BTreeMap::new(),
        };
        let aggregated = WeightingAggregator::new(config).aggregate(&results);

        prop_assert!((0.0..=5.0).contains(&aggregated.final_score));
        for score in aggregated.category_scores.values() {
            prop_assert!((0.0..=5.0).contains(score));
        }
        for score in aggregated.subcategory_scores.values() {
            prop_assert!((0.0..=5.0).contains(score));
        }
    }

    #[test]
    fn zero_sum_weights_equal_arithmetic_mean(
        scores in prop::collection::vec(0.0f64..=5.0, 2..5),
    ) {
        let ids = [
            "safety.sexual.sexual_content__v1_0",
            "age.readability.vocabulary__v1_0",
            "ethics.honesty.ai_disclosure__v1_0",
            "anthropomorphism.parasocial_bonds.persona_projection__v1_0",
        ];
        let results: Vec<_> = scores
            .iter()
            .enumerate()
            .map(|(i, &s)| criterion_result(ids[i], s))
            .collect();

        let mut categories = BTreeMap::new();
        for id in ids.iter().take(scores.len()) {
            let category = id.split('.').next().unwrap().to_string();
            categories.insert(category, 0.0);
        }
        let config = WeightsConfig {
            categories,
            subcategories: BTreeMap::new(),
            criteria: BTreeMap::new(),
        };
        let aggregated = WeightingAggregator::new(config).aggregate(&results);

        let category_mean: f64 = aggregated.category_scores.values().sum::<f64>()
            / aggregated.category_scores.len() as f64;
        prop_assert!((aggregated.final_score - category_mean).abs() < 1e-9);
    }
}

// --- Guardrail rule properties ---

fn rule_words() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just("never"), Just("claim"), Just("friendship"), Just("with"),
            Just("the"), Just("user"), Just("state"), Just("you"), Just("are"),
            Just("assistant"), Just("family"), Just("redirect"), Just("adult"),
            Just("trusted"), Just("feelings"), Just("human"), Just("identity"),
        ],
        2..10,
    )
    .prop_map(|words| words.join(" "))
}

proptest! {
    #[test]
    fn normalised_rules_are_in_normal_form(raw in "[a-zA-Z][a-zA-Z ]{0,120}") {
        let rule = normalise_rule(&raw);
        prop_assume!(!rule.is_empty());
        let first = rule
            .split_whitespace()
            .next()
            .unwrap()
            .trim_end_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        prop_assert!(
            IMPERATIVE_OPENERS.contains(&first.as_str()),
            "bad opener in {:?}",
            rule
        );
        prop_assert!(rule.ends_with('.'));
    }

    #[test]
    fn dedup_output_is_pairwise_dissimilar(
        rules in prop::collection::vec(rule_words(), 1..12)
    ) {
        let candidates: Vec<Candidate> = rules
            .iter()
            .map(|rule| Candidate {
                criterion_id: "c".into(),
                rule: rule.clone(),
                rationale: None,
                score: 1.0,
            })
            .collect();
        let deduped = dedup_candidates(candidates, 0.75);
        for (i, a) in deduped.iter().enumerate() {
            for b in deduped.iter().skip(i + 1) {
                let sim = jaccard(&tokenize(&a.rule), &tokenize(&b.rule));
                prop_assert!(sim < 0.75, "{:?} ~ {:?} = {}", a.rule, b.rule, sim);
            }
        }
    }
}

// --- Parser idempotence ---

static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    RUNTIME
        .get_or_init(|| {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
        })
        .block_on(future)
}

proptest! {
    #[test]
    fn parsing_serialised_pass_is_idempotent(
        score in 0.0f64..=5.0,
        explanation in "[a-z]{1,30}( [a-z]{1,12}){0,5}",
        evidence in prop::collection::vec("[a-z]{1,20}", 0..4),
    ) {
        let pass = ParsedPass {
            score,
            explanation,
            evidence_extracts: evidence,
        };
        let serialised = serde_json::to_string(&pass).unwrap();
        let parser = guardbench_core::parser::ResponseParser::new(None);
        let outcome = block_on(parser.parse(&serialised));
        match outcome {
            PassOutcome::Parsed { result, .. } => prop_assert_eq!(result, pass),
            PassOutcome::Sentinel { .. } => prop_assert!(false, "sentinel for valid JSON"),
        }
    }
}
