//! Properties that must hold for all inputs, exercised through the full
//! pipeline.

use chrono::Utc;
use pkm_e2e_tests::harness::{visit, Pipeline};
use pkm_e2e_tests::mocks::html_page;
use pkm_core::{
    Comparator, Condition, Namespace, PageType, ProceduralRule, RuleAction, RuleType,
    UserCorrection, WorkflowOutcome,
};

#[tokio::test]
async fn idempotent_intake_and_analysis() {
    let pipeline = Pipeline::new();

    let make = || {
        visit(
            "https://docs.example.com/intro",
            "2024-01-15T10:00:00Z",
            &html_page("Intro", 200),
        )
    };
    let visit_id = make().id.clone();

    pipeline.submit(make()).await.unwrap();
    let markdown_first = pipeline.markdown();

    // Same (url, page_loaded_at, content) submitted again
    pipeline.submit(make()).await.unwrap();

    // Exactly one relational row, one analysis, one vector entry
    assert_eq!(pipeline.storage.stats().unwrap().visits, 1);
    assert_eq!(pipeline.storage.stats().unwrap().analysed, 1);
    assert_eq!(pipeline.vectors.count(Namespace::WebpageContent).unwrap(), 1);
    assert!(pipeline
        .storage
        .get_analysis(&visit_id)
        .unwrap()
        .is_some());

    // Markdown head-match: byte-identical output
    assert_eq!(pipeline.markdown(), markdown_first);
}

#[tokio::test]
async fn filter_soundness_no_analysis_for_disallowed_types() {
    let pipeline = Pipeline::new();
    pipeline
        .llm
        .classify_as("videos.example.com", "leisure", 0.99, true);

    let v = visit(
        "https://videos.example.com/clip",
        "2024-01-15T12:00:00Z",
        &html_page("Funny Clip", 300),
    );
    let visit_id = v.id.clone();

    let outcome = pipeline.submit(v).await.unwrap();
    assert!(matches!(outcome, WorkflowOutcome::Rejected { .. }));

    // Steps 2-6 never ran: no extraction or analysis calls, no rows
    assert_eq!(pipeline.llm.calls_of("extract"), 0);
    assert_eq!(pipeline.llm.calls_of("analyse"), 0);
    assert!(pipeline.storage.get_analysis(&visit_id).unwrap().is_none());
    assert!(pipeline
        .vectors
        .get(Namespace::WebpageContent, &visit_id)
        .unwrap()
        .is_none());
    assert_eq!(pipeline.markdown(), "");
}

#[tokio::test]
async fn procedural_reject_precedes_default_accept() {
    let pipeline = Pipeline::new();

    // Both an accept and a reject rule match; reject has higher priority
    pipeline
        .procedural
        .add_rule(&ProceduralRule::new(
            "keep docs",
            RuleType::Domain,
            Condition::leaf("url", Comparator::Contains, "docs.example.com"),
            RuleAction::Accept,
            10,
        ))
        .unwrap();
    pipeline
        .procedural
        .add_rule(&ProceduralRule::new(
            "block drafts",
            RuleType::ContentPattern,
            Condition::leaf("url", Comparator::Contains, "/draft/"),
            RuleAction::Reject,
            100,
        ))
        .unwrap();

    let v = visit(
        "https://docs.example.com/draft/new-page",
        "2024-01-15T13:00:00Z",
        &html_page("Draft", 500),
    );
    let outcome = pipeline.submit(v).await.unwrap();
    let WorkflowOutcome::Rejected { reason } = outcome else {
        panic!("reject rule must win, got {:?}", outcome);
    };
    assert!(reason.contains("block drafts"));
}

#[tokio::test]
async fn correction_additivity_preserves_the_original() {
    let pipeline = Pipeline::new();

    let v = visit(
        "https://docs.example.com/intro",
        "2024-01-15T10:00:00Z",
        &html_page("Intro", 200),
    );
    pipeline.submit(v).await.unwrap();

    let episode = pipeline
        .episodic
        .get_by_domain("docs.example.com")
        .unwrap()
        .remove(0);
    let original_confidence = episode.confidence;
    let original_reasoning = episode.reasoning.clone();
    assert!(episode.original_decision);

    pipeline
        .episodic
        .add_user_correction(
            &episode.id,
            UserCorrection {
                corrected_decision: false,
                corrected_type: Some(PageType::Navigation),
                explanation: "just a landing page".to_string(),
                corrected_at: Utc::now(),
            },
        )
        .unwrap();

    let corrected = pipeline
        .episodic
        .get_by_domain("docs.example.com")
        .unwrap()
        .remove(0);
    assert!(corrected.original_decision, "original decision untouched");
    assert_eq!(corrected.confidence, original_confidence);
    assert_eq!(corrected.reasoning, original_reasoning);
    let correction = corrected.correction.expect("correction attached");
    assert!(!correction.corrected_decision);

    let stats = pipeline.episodic.statistics().unwrap();
    assert_eq!(stats.corrections, 1);
    assert_eq!(stats.false_positives, 1);
}

#[tokio::test]
async fn analysis_roundtrip_title_and_summary_bounds() {
    let pipeline = Pipeline::new();

    let v = visit(
        "https://docs.example.com/guide",
        "2024-01-15T10:00:00Z",
        &html_page("A Long Guide Title", 1500),
    );
    let visit_id = v.id.clone();
    pipeline.submit(v).await.unwrap();

    let analysis = pipeline.storage.get_analysis(&visit_id).unwrap().unwrap();
    assert!(!analysis.title.is_empty());
    assert!(analysis.summary.split_whitespace().count() <= 50);
}

#[tokio::test]
async fn markdown_rewrites_are_stable_across_tree_growth() {
    let pipeline = Pipeline::new();

    let first = visit(
        "https://docs.example.com/a",
        "2024-01-15T10:00:00Z",
        &html_page("A", 200),
    );
    pipeline.submit(first.clone()).await.unwrap();

    let mut second = visit(
        "https://docs.example.com/b",
        "2024-01-15T10:05:00Z",
        &html_page("B", 200),
    );
    second.referrer = Some("https://docs.example.com/a".to_string());
    second.referrer_timestamp = Some(first.page_loaded_at);
    pipeline.submit(second.clone()).await.unwrap();

    // Re-running the latest visit leaves the index byte-identical
    let before = pipeline.markdown();
    pipeline.submit(second).await.unwrap();
    assert_eq!(pipeline.markdown(), before);

    // Exactly one top-level entry: the grown tree replaced the original
    let top_level_bullets = before
        .lines()
        .filter(|line| line.starts_with("- ["))
        .count();
    assert_eq!(top_level_bullets, 1);
}
