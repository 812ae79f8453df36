//! End-to-end turn and ingestion scenarios over in-process fakes.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{harness, harness_with, Script, FAIL_EMBED};
use patrika_assist::agents::{APOLOGY_REPLY, NO_CONTEXT_REPLY};
use patrika_assist::progress::NoProgress;
use patrika_assist_core::envelope::{StreamEnvelope, TurnState};
use patrika_assist_core::intent::Intent;
use patrika_assist_core::models::Document;
use patrika_assist_core::routing::{support_menu, AD_BOOKING_REPLY};
use tokio::sync::mpsc;

const RP: &str = r#"{"intent": "rp"}"#;

fn doc(text: &str, filename: &str) -> Document {
    Document {
        text: text.to_string(),
        filename: filename.to_string(),
        source_type: "text".to_string(),
        ..Default::default()
    }
}

async fn drain(mut events: mpsc::Receiver<StreamEnvelope>) -> Vec<StreamEnvelope> {
    let mut out = Vec::new();
    while let Some(e) = events.recv().await {
        out.push(e);
    }
    out
}

#[tokio::test]
async fn ad_booking_shortcut_skips_classification_and_retrieval() {
    let h = harness(RP, Script::Deltas(vec!["unused"]));
    let turn = h.services.engine.collect_turn("  AD Booking ").await.unwrap();

    assert_eq!(turn.intent, Intent::AdBooking);
    assert_eq!(turn.message, AD_BOOKING_REPLY);
    assert_eq!(turn.support_menu.options, &["Customer", "Agency"]);
    assert_eq!(h.generator.classify_calls.load(Ordering::SeqCst), 0);
    assert!(h.generator.answer_prompts().is_empty());
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn streamed_chunks_concatenate_to_final_message() {
    let h = harness(RP, Script::Deltas(vec!["Patrika ", "was founded ", "in 1956."]));
    h.services
        .ingestor
        .upsert_document(&doc("Rajasthan Patrika was founded in 1956 in Jaipur.", "history.txt"))
        .await;

    let handle = h.services.engine.start_turn("When was Patrika founded?");
    let events = drain(handle.events).await;

    let mut seqs = Vec::new();
    let mut assembled = String::new();
    for e in &events[..events.len() - 1] {
        match e {
            StreamEnvelope::Chunk { seq, text } => {
                seqs.push(*seq);
                assembled.push_str(text);
            }
            other => panic!("unexpected envelope before terminal: {other:?}"),
        }
    }
    assert_eq!(seqs, vec![0, 1, 2]);

    let StreamEnvelope::Complete(turn) = events.last().unwrap() else {
        panic!("turn did not complete");
    };
    assert_eq!(turn.message, assembled);
    assert_eq!(turn.message, "Patrika was founded in 1956.");
    assert_eq!(turn.intent, Intent::Rp);
    assert_eq!(turn.support_menu, support_menu(Intent::Rp));

    let prompts = h.generator.answer_prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("Rajasthan Patrika was founded in 1956 in Jaipur."));
}

#[tokio::test]
async fn zero_matches_still_completes_with_no_context_answer() {
    let h = harness(RP, Script::Deltas(vec![]));
    let turn = h
        .services
        .engine
        .collect_turn("Who is the editor of the Indore edition?")
        .await
        .unwrap();

    assert!(!turn.message.is_empty());
    assert_eq!(turn.message, NO_CONTEXT_REPLY);
    let prompts = h.generator.answer_prompts();
    assert!(prompts[0].contains("No supporting context was found"));
}

#[tokio::test]
async fn generation_unavailable_falls_back_to_apology() {
    let h = harness(r#"{"intent": "other"}"#, Script::Unavailable);
    let turn = h.services.engine.collect_turn("hello there").await.unwrap();
    assert_eq!(turn.intent, Intent::Other);
    assert_eq!(turn.message, APOLOGY_REPLY);
    assert_eq!(turn.support_menu.options.len(), 4);
}

#[tokio::test]
async fn failure_mid_stream_ends_with_error_envelope() {
    let h = harness(r#"{"intent": "customer"}"#, Script::FailAfter(vec!["Step one: "]));
    let handle = h.services.engine.start_turn("how do I book a classified?");
    let events = drain(handle.events).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], StreamEnvelope::Chunk { seq: 0, text } if text == "Step one: "));
    assert!(matches!(&events[1], StreamEnvelope::Error { message } if message.contains("upstream reset")));

    let err = h
        .services
        .engine
        .collect_turn("how do I book a classified?")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("upstream reset"));
}

#[tokio::test]
async fn malformed_classifier_output_routes_to_other() {
    let h = harness("I am not sure, maybe weather?", Script::Deltas(vec!["Hi!"]));
    let turn = h.services.engine.collect_turn("what's up").await.unwrap();
    assert_eq!(turn.intent, Intent::Other);
    assert_eq!(turn.support_menu, support_menu(Intent::Other));
    assert_eq!(turn.message, "Hi!");
}

#[tokio::test]
async fn dropping_the_receiver_cancels_generation() {
    let h = harness(
        r#"{"intent": "other"}"#,
        Script::Slow {
            count: 200,
            delay: Duration::from_millis(10),
        },
    );
    let engine = h.services.engine.clone();
    let (tx, mut rx) = mpsc::channel(1);
    let task = tokio::spawn(async move { engine.run_turn("tell me a story", tx).await });

    for _ in 0..2 {
        assert!(matches!(rx.recv().await, Some(StreamEnvelope::Chunk { .. })));
    }
    drop(rx);

    let state = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("turn did not stop")
        .unwrap();
    assert_eq!(state, TurnState::Cancelled);

    let produced = h.generator.produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.generator.produced.load(Ordering::SeqCst), produced);
    assert!(produced < 200);
}

#[tokio::test]
async fn empty_document_is_reported_as_failure() {
    let h = harness(RP, Script::Deltas(vec![]));
    let report = h.services.ingestor.upsert_document(&doc("   \n\n ", "blank.txt")).await;
    assert_eq!(report.stored, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.chunks, 0);
    assert!(h.index.is_empty());
}

#[tokio::test]
async fn short_text_round_trips_as_one_chunk() {
    let h = harness(RP, Script::Deltas(vec![]));
    let report = h.services.ingestor.upsert_document(&doc(" a. b. c. ", "abc.txt")).await;
    assert_eq!((report.stored, report.failed, report.chunks), (1, 0, 1));

    let stored = h.index.get(&report.ids[0]).unwrap();
    assert_eq!(stored.metadata.text.as_deref(), Some("a. b. c."));
    assert_eq!(stored.metadata.chunk_index, Some(0));
    assert_eq!(stored.metadata.total_chunks, Some(1));
    assert_eq!(stored.metadata.filename.as_deref(), Some("abc.txt"));

    // Same content, same ids: re-ingestion overwrites.
    let again = h.services.ingestor.upsert_document(&doc(" a. b. c. ", "abc.txt")).await;
    assert_eq!(again.ids, report.ids);
    assert_eq!(h.index.len(), 1);
}

#[tokio::test]
async fn oversized_sentence_is_truncated_to_the_limit() {
    let h = harness_with(RP, Script::Deltas(vec![]), |c| c.chunking.max_chunk_bytes = 16);
    let sentence = "x".repeat(32);
    let report = h.services.ingestor.upsert_document(&doc(&sentence, "long.txt")).await;
    assert_eq!(report.chunks, 1);
    let stored = h.index.get(&report.ids[0]).unwrap();
    assert_eq!(stored.metadata.text.unwrap().len(), 16);
}

#[tokio::test]
async fn failed_chunk_embeddings_are_counted_not_fatal() {
    let h = harness_with(RP, Script::Deltas(vec![]), |c| c.chunking.max_chunk_bytes = 40);
    let text = format!("The history of the paper is long.\n\n{FAIL_EMBED} this paragraph.");
    let report = h.services.ingestor.upsert_document(&doc(&text, "mixed.txt")).await;
    assert_eq!(report.chunks, 2);
    assert_eq!(report.stored, 1);
    assert_eq!(report.failed, 1);
}

#[tokio::test]
async fn bulk_jsonl_reports_bad_lines_and_empty_objects() {
    let h = harness(RP, Script::Deltas(vec![]));
    let content = [
        r#"{"id": "a1", "text": "Founded in 1956 by Karpoor Chandra Kulish.", "url": "https://www.patrika.com/about"}"#,
        r#"{"content": "Ad booking opens at 10 AM.", "metadata": {"desk": "ads", "editor": null}}"#,
        r#"{"text": "unterminated"#,
        "",
        r#"{"image": 42}"#,
        r#"{"title": "Regional editions", "section": "about"}"#,
    ]
    .join("\n");

    let report = h
        .services
        .ingestor
        .ingest_jsonl(content.as_bytes(), "site.jsonl", &NoProgress)
        .await
        .unwrap();

    assert_eq!(report.total_objects, 4);
    assert_eq!(report.successful_stores, 3);
    assert_eq!(report.failed_stores, 1);
    assert_eq!(report.total_chunks, 3);
    assert!((report.success_rate - 75.0).abs() < 1e-9);
    assert_eq!(report.line_errors.len(), 1);
    assert_eq!(report.line_errors[0].line, 3);

    let first = h.index.get(&format!(
        "a1_chunk_0_{}",
        &patrika_assist_core::chunk::content_hash("Founded in 1956 by Karpoor Chandra Kulish.")[..8]
    ));
    let first = first.expect("record id drives the vector id");
    assert_eq!(first.metadata.site.as_deref(), Some("www.patrika.com"));
    assert_eq!(first.metadata.source_type.as_deref(), Some("jsonl"));
}
