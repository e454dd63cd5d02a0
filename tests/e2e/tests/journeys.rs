//! The end-to-end scenarios: full pipeline runs over the scripted LLM.

use chrono::Utc;
use pkm_e2e_tests::harness::{visit, visit_with_referrer, Pipeline};
use pkm_e2e_tests::mocks::html_page;
use pkm_core::{
    Comparator, Condition, ContentFeatures, Episode, Namespace, PageType, ProceduralRule,
    RuleAction, RuleType, UserCorrection, VisitProcessor, WorkflowOutcome,
};

#[tokio::test]
async fn fresh_visit_with_no_prior_memory() {
    let pipeline = Pipeline::new();

    let v = visit(
        "https://docs.example.com/intro",
        "2024-01-15T10:00:00Z",
        &html_page("Intro", 800),
    );
    let visit_id = v.id.clone();

    let outcome = pipeline.submit(v).await.unwrap();
    let WorkflowOutcome::Analysed { tree_id } = outcome else {
        panic!("expected the visit to be analysed, got {:?}", outcome);
    };

    // Analysis row with the page title
    let analysis = pipeline.storage.get_analysis(&visit_id).unwrap().unwrap();
    assert_eq!(analysis.title, "Intro");
    assert!(!analysis.summary.is_empty());

    // Full content lives in the vector store
    let record = pipeline
        .vectors
        .get(Namespace::WebpageContent, &visit_id)
        .unwrap()
        .unwrap();
    assert!(record.content.starts_with("# Intro"));

    // Markdown index entry under ## Webpages
    let markdown = pipeline.markdown();
    assert!(markdown.contains("## Webpages"));
    assert!(markdown.contains(
        "- [Intro](https://docs.example.com/intro) [2024-01-15 10:00]"
    ));

    // One accepting episode
    let stats = pipeline.episodic.statistics().unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.corrections, 0);
    let episodes = pipeline
        .episodic
        .get_by_domain("docs.example.com")
        .unwrap();
    assert_eq!(episodes.len(), 1);
    assert!(episodes[0].original_decision);

    // The visit landed in a tree with itself as head
    assert_eq!(
        pipeline.storage.tree_head(&tree_id).unwrap().as_deref(),
        Some(visit_id.as_str())
    );
}

#[tokio::test]
async fn reject_by_procedural_rule() {
    let pipeline = Pipeline::new();

    pipeline
        .procedural
        .add_rule(&ProceduralRule::new(
            "block facebook",
            RuleType::Domain,
            Condition::leaf("url", Comparator::Contains, "facebook.com"),
            RuleAction::Reject,
            100,
        ))
        .unwrap();

    let v = visit(
        "https://facebook.com/x",
        "2024-01-15T11:00:00Z",
        &html_page("Knowledge-looking Post", 900),
    );
    let visit_id = v.id.clone();

    let outcome = pipeline.submit(v).await.unwrap();
    let WorkflowOutcome::Rejected { reason } = outcome else {
        panic!("expected rejection, got {:?}", outcome);
    };
    assert!(reason.contains("block facebook"));

    // No analysis row, no vector entry; the raw visit row remains
    assert!(pipeline.storage.get_analysis(&visit_id).unwrap().is_none());
    assert!(pipeline
        .vectors
        .get(Namespace::WebpageContent, &visit_id)
        .unwrap()
        .is_none());
    assert!(pipeline.storage.get_visit(&visit_id).unwrap().is_some());

    // One rejecting episode whose reasoning references the rule
    let episodes = pipeline.episodic.get_by_domain("facebook.com").unwrap();
    assert_eq!(episodes.len(), 1);
    assert!(!episodes[0].original_decision);
    assert!(episodes[0].reasoning.contains("block facebook"));
}

#[tokio::test]
async fn orphan_reparented_when_opener_appears() {
    let pipeline = Pipeline::new();

    // Visit A: the page open in tab 7
    let a = visit(
        "https://parent.example.com",
        "2024-01-15T10:00:00Z",
        &html_page("Parent", 500),
    );
    let a_id = a.id.clone();
    pipeline.submit(a).await.unwrap();

    // Visit B arrives citing opener tab 7 before any event for tab 7
    let mut b = visit(
        "https://child.example.com/page",
        "2024-01-15T10:00:05Z",
        &html_page("Child", 600),
    );
    b.opener_tab_id = Some(7);
    let b_id = b.id.clone();
    pipeline.storage.insert_visit(&b).unwrap();
    pipeline.orphans.lock().await.add(b, 7);

    // Tab 7 appears with the parent URL; intake would now reparent
    pipeline.tracker.lock().await.on_tab_created(
        7,
        Some("https://parent.example.com".to_string()),
        None,
    );
    let (url, at) = pipeline.tracker.lock().await.current_of(7).unwrap();

    let (taken, _) = pipeline.orphans.lock().await.take_for(7);
    assert_eq!(taken.len(), 1);
    for mut orphan in taken {
        pipeline
            .storage
            .update_visit_referrer(&orphan.visit.id, &url, Some(at))
            .unwrap();
        orphan.visit.referrer = Some(url.clone());
        orphan.visit.referrer_timestamp = Some(at);
        pipeline.workflow.process(orphan.visit).await.unwrap();
    }

    // B's persisted referrer is the parent page
    let stored = pipeline.storage.get_visit(&b_id).unwrap().unwrap();
    assert_eq!(stored.referrer.as_deref(), Some("https://parent.example.com"));

    // A and B share a tree headed by A. The tracker captured tab 7's URL
    // at event time, which is after A's load, so B resolves to A's tree
    // through the referrer URL.
    let tree_a = pipeline.storage.tree_of_visit(&a_id).unwrap().unwrap();
    let tree_b = pipeline.storage.tree_of_visit(&b_id).unwrap().unwrap();
    assert_eq!(tree_a, tree_b);
    assert_eq!(
        pipeline.storage.tree_head(&tree_a).unwrap().as_deref(),
        Some(a_id.as_str())
    );
}

#[tokio::test]
async fn orphan_exhausted_is_persisted_as_root() {
    let pipeline = Pipeline::new();

    let mut b = visit(
        "https://lonely.example.com",
        "2024-01-15T10:00:00Z",
        &html_page("Lonely", 500),
    );
    b.opener_tab_id = Some(42);
    let b_id = b.id.clone();
    pipeline.storage.insert_visit(&b).unwrap();
    pipeline.orphans.lock().await.add(b, 42);

    // Tab 42 never appears; the retry scan bumps until exhaustion
    let exhausted = {
        let mut orphans = pipeline.orphans.lock().await;
        let mut exhausted = None;
        for _ in 0..pkm_core::MAX_RETRIES {
            exhausted = orphans.bump(42, &b_id);
        }
        exhausted.expect("orphan should exhaust its retries")
    };
    pipeline.workflow.process(exhausted.visit).await.unwrap();

    // Persisted as a root: analysed, no referrer
    let stored = pipeline.storage.get_visit(&b_id).unwrap().unwrap();
    assert!(stored.referrer.is_none());
    assert!(pipeline.storage.get_analysis(&b_id).unwrap().is_some());
    assert_eq!(pipeline.orphans.lock().await.stats().retry_exhausted, 1);
}

#[tokio::test]
async fn tree_intentions_rewritten_as_tree_grows() {
    let pipeline = Pipeline::new();

    let first = visit(
        "https://docs.example.com/a",
        "2024-01-15T10:00:00Z",
        &html_page("A", 400),
    );
    let first_id = first.id.clone();
    pipeline.submit(first).await.unwrap();

    // Alone, the page keeps its per-page intentions
    let markdown_before = pipeline.markdown();
    assert!(markdown_before.contains("read about a"));

    let second = visit_with_referrer(
        "https://docs.example.com/b",
        "2024-01-15T10:00:10Z",
        &html_page("B", 400),
        "https://docs.example.com/a",
        "2024-01-15T10:00:00Z",
    );
    pipeline.submit(second).await.unwrap();

    let third = visit_with_referrer(
        "https://docs.example.com/c",
        "2024-01-15T10:00:20Z",
        &html_page("C", 400),
        "https://docs.example.com/b",
        "2024-01-15T10:00:10Z",
    );
    pipeline.submit(third).await.unwrap();

    // The first visit's collective intentions now differ from the
    // per-page ones computed when it was analysed alone
    let tree_id = pipeline.storage.tree_of_visit(&first_id).unwrap().unwrap();
    let intentions = pipeline.storage.get_tree_intentions(&tree_id).unwrap();
    assert_eq!(
        intentions.by_visit.get(&0).unwrap(),
        &vec!["session goal across 3 pages".to_string()]
    );

    // And the markdown index reflects the latest values
    let markdown_after = pipeline.markdown();
    assert!(markdown_after.contains("session goal across 3 pages"));
    assert!(!markdown_after.contains("read about"));
}

#[tokio::test]
async fn episodic_corrections_flip_the_decision() {
    let pipeline = Pipeline::new();

    // Three accepted-then-corrected episodes on the domain
    for i in 0..3 {
        let mut episode = Episode::new(
            format!("https://python-news.example/{}", i),
            PageType::Knowledge,
            0.9,
            true,
            "looked like documentation",
            ContentFeatures::default(),
        );
        episode.correction = Some(UserCorrection {
            corrected_decision: false,
            corrected_type: Some(PageType::Aggregator),
            explanation: "actually a news feed".to_string(),
            corrected_at: Utc::now(),
        });
        pipeline.episodic.store_episode(&episode).await.unwrap();
    }

    // A new visit on that domain with a confident knowledge classification
    pipeline
        .llm
        .classify_as("python-news.example", "knowledge", 0.9, true);
    let v = visit(
        "https://python-news.example/latest",
        "2024-01-16T09:00:00Z",
        &html_page("Daily Python News", 700),
    );

    let outcome = pipeline.submit(v).await.unwrap();
    let WorkflowOutcome::Rejected { reason } = outcome else {
        panic!("expected the domain pattern to reject, got {:?}", outcome);
    };
    assert!(reason.contains("domain pattern"));
    assert!(reason.contains("python-news.example"));

    // Boost recorded at -0.2 via the filter's episode trail
    let episodes = pipeline
        .episodic
        .get_by_domain("python-news.example")
        .unwrap();
    let newest = episodes
        .iter()
        .max_by_key(|e| e.timestamp)
        .expect("episodes exist");
    assert!(!newest.original_decision);
}

#[tokio::test]
async fn tab_chain_referrer_feeds_the_tree() {
    let pipeline = Pipeline::new();

    // Browser navigates within one tab; intake resolves referrers from the
    // tracker.
    {
        let mut tracker = pipeline.tracker.lock().await;
        tracker.on_tab_created(1, Some("https://docs.example.com/start".to_string()), None);
        tracker.on_tab_updated(1, Some("https://docs.example.com/deep".to_string()), None);
    }

    let start = visit(
        "https://docs.example.com/start",
        "2024-01-15T10:00:00Z",
        &html_page("Start", 300),
    );
    let start_id = start.id.clone();
    pipeline.submit(start).await.unwrap();

    let mut deep = visit(
        "https://docs.example.com/deep",
        "2024-01-15T10:00:30Z",
        &html_page("Deep", 300),
    );
    let (referrer, at) = pipeline.tracker.lock().await.get_referrer(1).unwrap();
    deep.referrer = Some(referrer);
    deep.referrer_timestamp = Some(at);
    let deep_id = deep.id.clone();
    pipeline.submit(deep).await.unwrap();

    let tree_start = pipeline.storage.tree_of_visit(&start_id).unwrap().unwrap();
    let tree_deep = pipeline.storage.tree_of_visit(&deep_id).unwrap().unwrap();
    assert_eq!(tree_start, tree_deep);

    let markdown = pipeline.markdown();
    assert!(markdown.contains("  - [Deep](https://docs.example.com/deep)"));
    assert!(markdown.contains("Referrer: https://docs.example.com/start"));
}
