// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

fn rules(yaml: &str) -> Vec<RelabelConfig> {
  let rules: Vec<RelabelConfig> = serde_yaml::from_str(yaml).unwrap();
  for rule in &rules {
    rule.validate().unwrap();
  }
  rules
}

#[test]
fn replace() {
  let rules = rules(
    r#"
- source_labels: [a, b]
  regex: "(.*);(.*)"
  target_label: c
  replacement: "${2}-${1}"
"#,
  );
  assert_eq!(
    Some(Labels::from_pairs(&[("a", "foo"), ("b", "bar"), ("c", "bar-foo")])),
    process(&Labels::from_pairs(&[("a", "foo"), ("b", "bar")]), &rules)
  );
}

#[test]
fn replace_no_match_is_noop() {
  let rules = rules(
    r"
- source_labels: [a]
  regex: nomatch
  target_label: c
",
  );
  let labels = Labels::from_pairs(&[("a", "foo")]);
  assert_eq!(Some(labels.clone()), process(&labels, &rules));
}

#[test]
fn replace_empty_deletes() {
  let rules = rules(
    r#"
- source_labels: [missing]
  target_label: a
  replacement: ""
"#,
  );
  assert_eq!(
    Some(Labels::from_pairs(&[("b", "1")])),
    process(&Labels::from_pairs(&[("a", "foo"), ("b", "1")]), &rules)
  );
}

#[test]
fn regex_is_anchored() {
  let rules = rules(
    r"
- source_labels: [a]
  regex: oo
  action: keep
",
  );
  assert_eq!(None, process(&Labels::from_pairs(&[("a", "foo")]), &rules));
}

#[test]
fn keep_and_drop() {
  let keep = rules(
    r"
- source_labels: [job]
  regex: api|web
  action: keep
",
  );
  assert!(process(&Labels::from_pairs(&[("job", "api")]), &keep).is_some());
  assert!(process(&Labels::from_pairs(&[("job", "db")]), &keep).is_none());

  let drop = rules(
    r"
- source_labels: [job]
  regex: api
  action: drop
",
  );
  assert!(process(&Labels::from_pairs(&[("job", "api")]), &drop).is_none());
  assert!(process(&Labels::from_pairs(&[("job", "db")]), &drop).is_some());
}

#[test]
fn keepequal_and_dropequal() {
  let keep = rules(
    r"
- source_labels: [a]
  target_label: b
  action: keepequal
",
  );
  assert!(process(&Labels::from_pairs(&[("a", "1"), ("b", "1")]), &keep).is_some());
  assert!(process(&Labels::from_pairs(&[("a", "1"), ("b", "2")]), &keep).is_none());

  let drop = rules(
    r"
- source_labels: [a]
  target_label: b
  action: dropequal
",
  );
  assert!(process(&Labels::from_pairs(&[("a", "1"), ("b", "1")]), &drop).is_none());
}

#[test]
fn labelmap_labeldrop_labelkeep() {
  let labels = Labels::from_pairs(&[
    ("__meta_pod_label_app", "web"),
    ("__meta_pod_name", "p1"),
    ("job", "test"),
  ]);
  let map = rules(
    r"
- regex: __meta_pod_label_(.+)
  action: labelmap
- regex: __meta_.*
  action: labeldrop
",
  );
  assert_eq!(
    Some(Labels::from_pairs(&[("app", "web"), ("job", "test")])),
    process(&labels, &map)
  );

  let keep = rules(
    r"
- regex: job
  action: labelkeep
",
  );
  assert_eq!(
    Some(Labels::from_pairs(&[("job", "test")])),
    process(&labels, &keep)
  );
}

#[test]
fn case_and_hashmod() {
  let rules = rules(
    r"
- source_labels: [a]
  target_label: lower
  action: lowercase
- source_labels: [a]
  target_label: upper
  action: uppercase
- source_labels: [a]
  target_label: shard
  modulus: 4
  action: hashmod
",
  );
  let result = process(&Labels::from_pairs(&[("a", "MiXeD")]), &rules).unwrap();
  assert_eq!(Some("mixed"), result.get("lower"));
  assert_eq!(Some("MIXED"), result.get("upper"));
  let shard: u64 = result.get("shard").unwrap().parse().unwrap();
  assert!(shard < 4);

  // Hashing is deterministic.
  let again = process(&Labels::from_pairs(&[("a", "MiXeD")]), &rules).unwrap();
  assert_eq!(result.get("shard"), again.get("shard"));
}

#[test]
fn dropping_every_label_drops_the_set() {
  let rules = rules(
    r"
- regex: .*
  action: labeldrop
",
  );
  assert_eq!(None, process(&Labels::from_pairs(&[("a", "1")]), &rules));
}

#[test]
fn validation() {
  assert_matches!(
    RelabelConfig {
      action: Action::HashMod,
      target_label: "a".into(),
      ..Default::default()
    }
    .validate(),
    Err(RelabelError::MissingModulus(Action::HashMod))
  );
  assert_matches!(
    RelabelConfig::default().validate(),
    Err(RelabelError::MissingTargetLabel(Action::Replace))
  );
  assert_matches!(
    RelabelConfig {
      action: Action::LabelDrop,
      source_labels: vec!["a".into()],
      ..Default::default()
    }
    .validate(),
    Err(RelabelError::UnexpectedFields(Action::LabelDrop))
  );
  assert!(serde_yaml::from_str::<RelabelConfig>("regex: '('").is_err());
}
