use super::*;
use serde_json::json;
use std::collections::HashSet;

fn records(values: Vec<serde_json::Value>) -> Vec<Record> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).expect("test record is a mapping"))
        .collect()
}

fn sequence_generator(ids: &[&str]) -> impl FnMut() -> String {
    let mut ids: Vec<String> = ids.iter().rev().map(|s| (*s).to_string()).collect();
    move || ids.pop().expect("generator ran out of identifiers")
}

fn assert_unique_non_empty(records: &[Record]) {
    let ids: HashSet<String> = records.iter().map(Record::id).collect();
    assert_eq!(ids.len(), records.len());
    assert!(records.iter().all(|r| !r.id().is_empty()));
}

#[test]
fn first_occurrence_keeps_identifier() {
    let mut input = records(vec![
        json!({"id": "a", "title": "first"}),
        json!({"id": "a", "title": "second"}),
        json!({"title": "third"}),
    ]);

    let report = deduplicate(&mut input);

    assert_eq!(input.len(), 3);
    assert_unique_non_empty(&input);
    assert_eq!(input[0].id(), "a");
    assert_eq!(input[0].get("title"), Some(&json!("first")));
    assert_ne!(input[1].id(), "a");
    assert_eq!(input[1].get("title"), Some(&json!("second")));
    assert_eq!(input[2].get("title"), Some(&json!("third")));
    assert_eq!(
        report,
        DedupReport {
            replaced_duplicates: 1,
            assigned_missing: 1
        }
    );
    assert_eq!(report.changed(), 2);
}

#[test]
fn empty_and_null_identifiers_are_assigned() {
    let mut input = records(vec![
        json!({"id": ""}),
        json!({"id": null}),
        json!({"id": "kept"}),
    ]);

    let report = deduplicate_with(&mut input, sequence_generator(&["g1", "g2"]));

    assert_eq!(input[0].id(), "g1");
    assert_eq!(input[1].id(), "g2");
    assert_eq!(input[2].id(), "kept");
    assert_eq!(report.assigned_missing, 2);
    assert_eq!(report.replaced_duplicates, 0);
}

#[test]
fn colliding_generated_identifier_is_redrawn() {
    let mut input = records(vec![json!({"id": "x"}), json!({"id": "x"}), json!({})]);

    // The generator first repeats an existing id, then an empty one
    deduplicate_with(&mut input, sequence_generator(&["x", "", "y", "y", "z"]));

    assert_eq!(input[0].id(), "x");
    assert_eq!(input[1].id(), "y");
    assert_eq!(input[2].id(), "z");
    assert_unique_non_empty(&input);
}

#[test]
fn numeric_identifiers_are_normalised_to_text() {
    let mut input = records(vec![json!({"id": 7}), json!({"id": "7"})]);

    deduplicate_with(&mut input, sequence_generator(&["fresh"]));

    assert_eq!(input[0].get("id"), Some(&json!("7")));
    assert_eq!(input[1].id(), "fresh");
}

#[test]
fn running_twice_is_a_no_op() {
    let mut input = records(vec![
        json!({"id": "a"}),
        json!({"id": "a"}),
        json!({}),
        json!({"id": "b"}),
        json!({"id": "b"}),
    ]);

    deduplicate(&mut input);
    let once = input.clone();
    let report = deduplicate(&mut input);

    assert_eq!(input, once);
    assert_eq!(report, DedupReport::default());
    assert_unique_non_empty(&input);
}

#[test]
fn preserves_length_for_many_duplicates() {
    let mut input = records((0..250).map(|i| json!({"id": (i % 7).to_string()})).collect());

    deduplicate(&mut input);

    assert_eq!(input.len(), 250);
    assert_unique_non_empty(&input);
    for (i, record) in input.iter().enumerate().take(7) {
        assert_eq!(record.id(), i.to_string());
    }
}

#[test]
fn empty_input() {
    let mut input: Vec<Record> = Vec::new();
    assert_eq!(deduplicate(&mut input), DedupReport::default());
}
