//! End-to-end behavior of the storage engine through its public API.

use std::collections::BTreeMap;
use std::sync::Mutex;

use nodefile::{
    ChangeEvent, ChangeObserver, NodeValue, OpenOptions, PathKey, QueryCriterion, QueryOp,
    StorageEngine,
};

fn small_db() -> StorageEngine {
    // Small geometry so multi-record and fragmentation paths get exercised
    OpenOptions::new()
        .page_size(32)
        .record_size(64)
        .max_inline_value_size(32)
        .open_in_memory()
        .unwrap()
}

fn obj(entries: &[(&str, NodeValue)]) -> NodeValue {
    NodeValue::Object(
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    )
}

#[test]
fn set_then_get_object() {
    let db = small_db();
    db.set(
        "game/config",
        obj(&[
            ("name", NodeValue::str("g")),
            ("max_players", NodeValue::Number(10.0)),
        ]),
    )
    .unwrap();
    assert_eq!(
        db.get_value("game/config").unwrap(),
        obj(&[
            ("name", NodeValue::str("g")),
            ("max_players", NodeValue::Number(10.0)),
        ])
    );
    assert!(db.exists("game/config").unwrap());
    assert!(db.exists("game").unwrap());
    assert!(!db.exists("game/config/missing").unwrap());
}

#[test]
fn merge_update_keeps_existing_children() {
    let db = small_db();
    db.set(
        "game/config",
        obj(&[
            ("name", NodeValue::str("g")),
            ("max_players", NodeValue::Number(10.0)),
        ]),
    )
    .unwrap();
    db.update("game/config", obj(&[("description", NodeValue::str("d"))]), true)
        .unwrap();
    assert_eq!(
        db.get_value("game/config").unwrap(),
        obj(&[
            ("description", NodeValue::str("d")),
            ("max_players", NodeValue::Number(10.0)),
            ("name", NodeValue::str("g")),
        ])
    );
}

#[test]
fn merge_is_idempotent() {
    let db = small_db();
    db.set("doc", obj(&[("a", NodeValue::Number(1.0))])).unwrap();
    let patch = obj(&[
        ("b", NodeValue::str("long enough to need its own record, well past inline size")),
        ("c", NodeValue::Boolean(true)),
    ]);
    db.update("doc", patch.clone(), true).unwrap();
    let once = db.get_value("doc").unwrap();
    db.update("doc", patch, true).unwrap();
    let twice = db.get_value("doc").unwrap();
    assert_eq!(once, twice);
}

#[test]
fn transaction_applies_interest() {
    let db = small_db();
    db.set("accounts/a/balance", NodeValue::Number(100.0))
        .unwrap();
    db.transaction("accounts/a/balance", |current| {
        let b = current.as_number().unwrap();
        Some(NodeValue::Number(b * 1.02))
    })
    .unwrap();
    assert_eq!(
        db.get_value("accounts/a/balance").unwrap(),
        NodeValue::Number(100.0 * 1.02)
    );
}

#[test]
fn cancelled_transaction_writes_nothing() {
    let db = small_db();
    db.set("counter", NodeValue::Number(7.0)).unwrap();
    db.transaction("counter", |_| None).unwrap();
    assert_eq!(db.get_value("counter").unwrap(), NodeValue::Number(7.0));
}

#[test]
fn push_returns_a_24_char_key() {
    let db = small_db();
    let key = db
        .push("posts", obj(&[("title", NodeValue::str("t"))]))
        .unwrap();
    assert_eq!(key.len(), 24);
    assert_eq!(
        db.get_value(&format!("posts/{}", key)).unwrap(),
        obj(&[("title", NodeValue::str("t"))])
    );
    // Push keys are time-ordered, so iteration yields insertion order
    let key2 = db
        .push("posts", obj(&[("title", NodeValue::str("t2"))]))
        .unwrap();
    assert!(key < key2);
}

#[test]
fn many_children_promote_to_key_tree() {
    let db = small_db();
    for i in 0..150u32 {
        db.set(
            &format!("items/k{}", i),
            obj(&[("n", NodeValue::Number(i as f64))]),
        )
        .unwrap();
        let record = db.node_record("items").unwrap().unwrap();
        if i < 100 {
            assert!(!record.has_key_tree, "no tree expected at {} children", i + 1);
        } else {
            assert!(record.has_key_tree, "tree expected at {} children", i + 1);
        }
    }
    assert_eq!(
        db.get_value("items/k142").unwrap(),
        obj(&[("n", NodeValue::Number(142.0))])
    );
    // Reads through the tree agree with reads of the whole node
    let all = db.get_value("items").unwrap();
    let map = all.as_object().unwrap();
    assert_eq!(map.len(), 150);
    assert_eq!(
        map.get("k17"),
        Some(&obj(&[("n", NodeValue::Number(17.0))]))
    );
}

#[test]
fn inline_threshold_decides_record_allocation() {
    let db = small_db(); // max_inline_value_size = 32
    db.set("a/small", NodeValue::str("x".repeat(31))).unwrap();
    db.set("a/large", NodeValue::str("x".repeat(33))).unwrap();

    assert_eq!(
        db.get_value("a/small").unwrap(),
        NodeValue::str("x".repeat(31))
    );
    assert_eq!(
        db.get_value("a/large").unwrap(),
        NodeValue::str("x".repeat(33))
    );
    // The small one lives inline in its parent; the large one got a record
    assert!(db.node_record("a/small").unwrap().is_none());
    let large = db.node_record("a/large").unwrap().unwrap();

    // Removing the large child frees its record and the parent forgets it
    db.remove("a/large").unwrap();
    assert!(db.is_free(large.address));
    assert!(!db.exists("a/large").unwrap());
    assert_eq!(db.get_value("a/large").unwrap(), NodeValue::Null);
    let children: Vec<_> = db
        .get_children("a", None)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].key, Some(PathKey::name("small")));
}

#[test]
fn delete_cascades_and_frees_storage() {
    let db = small_db();
    let baseline = db.storage_stats().allocated_records;
    db.set(
        "tree",
        obj(&[
            ("leaf", NodeValue::str("y".repeat(100))),
            (
                "branch",
                obj(&[("deep", NodeValue::str("z".repeat(100)))]),
            ),
        ]),
    )
    .unwrap();
    assert!(db.storage_stats().allocated_records > baseline);
    let leaf = db.node_record("tree/leaf").unwrap().unwrap();
    let deep = db.node_record("tree/branch/deep").unwrap().unwrap();

    db.remove("tree").unwrap();
    assert!(!db.exists("tree").unwrap());
    assert!(!db.exists("tree/branch/deep").unwrap());
    assert!(db.is_free(leaf.address));
    assert!(db.is_free(deep.address));
    assert_eq!(db.storage_stats().allocated_records, baseline);
}

#[test]
fn no_leakage_over_set_remove_cycles() {
    let db = small_db();
    let baseline = db.storage_stats().allocated_records;
    for round in 0..5 {
        for i in 0..10 {
            db.set(
                &format!("cycle/item{}", i),
                obj(&[
                    ("round", NodeValue::Number(round as f64)),
                    ("payload", NodeValue::str("p".repeat(50 + i))),
                ]),
            )
            .unwrap();
        }
        db.remove("cycle").unwrap();
    }
    assert_eq!(db.storage_stats().allocated_records, baseline);
}

#[test]
fn value_round_trips() {
    let db = small_db();
    let values = [
        NodeValue::Boolean(true),
        NodeValue::Boolean(false),
        NodeValue::Number(0.0),
        NodeValue::Number(15.0),
        NodeValue::Number(-1.5),
        NodeValue::Number(std::f64::consts::PI),
        NodeValue::Number(1.0e300),
        NodeValue::DateTime(1_722_470_400_000),
        NodeValue::DateTime(-1000),
        NodeValue::str(""),
        NodeValue::str("short"),
        NodeValue::str("л юникод"),
        NodeValue::str("x".repeat(500)),
        NodeValue::Binary(vec![]),
        NodeValue::Binary(vec![0, 1, 2, 255]),
        NodeValue::Binary((0..=255).collect()),
        NodeValue::Reference(String::new()),
        NodeValue::Reference("users/someone".into()),
        NodeValue::Object(BTreeMap::new()),
        NodeValue::Array(vec![]),
        obj(&[("nested", obj(&[("deep", NodeValue::Number(42.0))]))]),
        NodeValue::Array(vec![
            NodeValue::Number(1.0),
            NodeValue::str("two"),
            NodeValue::Array(vec![NodeValue::Boolean(false)]),
        ]),
    ];
    for (i, v) in values.iter().enumerate() {
        let path = format!("roundtrip/v{}", i);
        db.set(&path, v.clone()).unwrap();
        assert_eq!(&db.get_value(&path).unwrap(), v, "value {}", i);
    }
}

#[test]
fn null_children_are_absent() {
    let db = small_db();
    let mut map = BTreeMap::new();
    map.insert("keep".to_string(), NodeValue::Number(1.0));
    map.insert("drop".to_string(), NodeValue::Null);
    db.set("doc", NodeValue::Object(map)).unwrap();
    assert_eq!(
        db.get_value("doc").unwrap(),
        obj(&[("keep", NodeValue::Number(1.0))])
    );
}

#[test]
fn parent_entry_tracks_relocated_child() {
    let db = small_db();
    db.set("p/c", NodeValue::str("a".repeat(40))).unwrap();
    let first = db.node_record("p/c").unwrap().unwrap();

    // Grow the child so its record must move to a larger allocation
    db.set("p/c", NodeValue::str("b".repeat(400))).unwrap();
    let second = db.node_record("p/c").unwrap().unwrap();
    assert_ne!(first.address, second.address);
    assert!(db.is_free(first.address));

    // The parent resolves the child at its new address
    let info = db.locate("p/c").unwrap();
    assert_eq!(info.address, Some(second.address));
    assert_eq!(db.get_value("p/c").unwrap(), NodeValue::str("b".repeat(400)));
}

#[test]
fn arrays_update_by_index() {
    let db = small_db();
    db.set(
        "list",
        NodeValue::Array(vec![
            NodeValue::Number(1.0),
            NodeValue::Number(2.0),
            NodeValue::Number(3.0),
        ]),
    )
    .unwrap();
    db.set("list[1]", NodeValue::Number(20.0)).unwrap();
    assert_eq!(
        db.get_value("list").unwrap(),
        NodeValue::Array(vec![
            NodeValue::Number(1.0),
            NodeValue::Number(20.0),
            NodeValue::Number(3.0),
        ])
    );
    assert_eq!(db.get_value("list[2]").unwrap(), NodeValue::Number(3.0));
}

#[test]
fn get_children_streams_and_cancels() {
    let db = small_db();
    for i in 0..10 {
        db.set(&format!("set/c{}", i), NodeValue::Number(i as f64))
            .unwrap();
    }
    let mut count = 0;
    for child in db.get_children("set", None).unwrap() {
        child.unwrap();
        count += 1;
        if count == 3 {
            break; // dropping the iterator cancels the stream
        }
    }
    assert_eq!(count, 3);

    // Key-filtered streaming
    let keys = [PathKey::name("c3"), PathKey::name("c7")];
    let got: Vec<_> = db
        .get_children("set", Some(&keys))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(got.len(), 2);

    // Missing paths surface NodeNotFound
    assert!(matches!(
        db.get_children("nope", None),
        Err(nodefile::Error::NodeNotFound { .. })
    ));
}

#[test]
fn get_child_info_reports_missing_children() {
    let db = small_db();
    db.set("node/present", NodeValue::Number(5.0)).unwrap();
    let found = db
        .get_child_info("node", &PathKey::name("present"))
        .unwrap();
    assert!(found.exists);
    assert_eq!(found.value, Some(NodeValue::Number(5.0)));
    let missing = db.get_child_info("node", &PathKey::name("absent")).unwrap();
    assert!(!missing.exists);
}

#[test]
fn filtered_get_value() {
    let db = small_db();
    db.set(
        "user",
        obj(&[
            ("name", NodeValue::str("ewout")),
            ("secret", NodeValue::str("hunter2")),
            (
                "address",
                obj(&[
                    ("city", NodeValue::str("Amsterdam")),
                    ("zip", NodeValue::str("1234AB")),
                ]),
            ),
        ]),
    )
    .unwrap();

    let filter = nodefile::ValueFilter::new(&["name", "address/city"], &[], None);
    assert_eq!(
        db.get_value_with("user", &filter).unwrap(),
        obj(&[
            ("name", NodeValue::str("ewout")),
            ("address", obj(&[("city", NodeValue::str("Amsterdam"))])),
        ])
    );

    let filter = nodefile::ValueFilter::new(&[], &["secret"], None);
    assert_eq!(
        db.get_value_with("user", &filter).unwrap(),
        obj(&[
            ("name", NodeValue::str("ewout")),
            (
                "address",
                obj(&[
                    ("city", NodeValue::str("Amsterdam")),
                    ("zip", NodeValue::str("1234AB")),
                ])
            ),
        ])
    );
}

#[test]
fn matches_operators() {
    let db = small_db();
    db.set(
        "games/g1",
        obj(&[
            ("name", NodeValue::str("chess")),
            ("players", NodeValue::Number(2.0)),
            ("tags", NodeValue::Array(vec![NodeValue::str("classic")])),
            ("meta", obj(&[("rated", NodeValue::Boolean(true))])),
        ]),
    )
    .unwrap();

    let yes = |criteria: Vec<QueryCriterion>| db.matches("games/g1", &criteria).unwrap();
    assert!(yes(vec![QueryCriterion::new(
        "players",
        QueryOp::Eq(NodeValue::Number(2.0)),
    )]));
    assert!(yes(vec![
        QueryCriterion::new("players", QueryOp::Between(NodeValue::Number(1.0), NodeValue::Number(4.0))),
        QueryCriterion::new("name", QueryOp::Matches(regex::Regex::new("^ch").unwrap())),
        QueryCriterion::new("tags", QueryOp::Contains(NodeValue::str("classic"))),
        QueryCriterion::new("meta", QueryOp::Has("rated".into())),
        QueryCriterion::new("name", QueryOp::Exists),
        QueryCriterion::new("missing", QueryOp::NotExists),
    ]));
    assert!(!yes(vec![QueryCriterion::new(
        "players",
        QueryOp::Gt(NodeValue::Number(2.0)),
    )]));
    assert!(!yes(vec![QueryCriterion::new(
        "name",
        QueryOp::In(vec![NodeValue::str("go"), NodeValue::str("shogi")]),
    )]));
    assert!(yes(vec![QueryCriterion::new(
        "players",
        QueryOp::Custom(Box::new(|v| v.as_number() == Some(2.0))),
    )]));
    assert!(!db.matches("games/absent", &[]).unwrap());
}

#[test]
fn observer_receives_old_and_new_values() {
    #[derive(Clone, Default)]
    struct Capture {
        events: std::sync::Arc<Mutex<Vec<ChangeEvent>>>,
    }
    impl ChangeObserver for Capture {
        fn top_event_path(&self, _path: &str) -> Option<String> {
            Some("watched".to_string())
        }
        fn notify(&self, event: &ChangeEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    let capture = Capture::default();
    let db = OpenOptions::new()
        .page_size(32)
        .record_size(64)
        .max_inline_value_size(32)
        .observer(Box::new(capture.clone()))
        .open_in_memory()
        .unwrap();

    db.set("watched/value", NodeValue::Number(1.0)).unwrap();
    db.set("watched/value", NodeValue::Number(2.0)).unwrap();

    let events = capture.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].path, "watched/value");
    assert_eq!(events[0].top_path, "watched");
    assert_eq!(events[0].old_value, NodeValue::Null);
    assert_eq!(
        events[0].new_value,
        obj(&[("value", NodeValue::Number(1.0))])
    );
    assert_eq!(
        events[1].old_value,
        obj(&[("value", NodeValue::Number(1.0))])
    );
    assert_eq!(
        events[1].new_value,
        obj(&[("value", NodeValue::Number(2.0))])
    );
}

#[test]
fn reopen_preserves_data_and_rebuilds_free_space() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.db");

    let stats_before;
    {
        let db = OpenOptions::new()
            .page_size(32)
            .record_size(64)
            .max_inline_value_size(32)
            .open(&path)
            .unwrap();
        db.set(
            "persist",
            obj(&[
                ("text", NodeValue::str("w".repeat(200))),
                ("n", NodeValue::Number(5.0)),
            ]),
        )
        .unwrap();
        for i in 0..120 {
            db.set(&format!("bulk/e{}", i), NodeValue::Number(i as f64))
                .unwrap();
        }
        stats_before = db.storage_stats();
        db.flush().unwrap();
    }

    let db = nodefile::open(&path).unwrap();
    assert_eq!(
        db.get_value("persist").unwrap(),
        obj(&[
            ("text", NodeValue::str("w".repeat(200))),
            ("n", NodeValue::Number(5.0)),
        ])
    );
    assert_eq!(db.get_value("bulk/e57").unwrap(), NodeValue::Number(57.0));
    assert!(db.node_record("bulk").unwrap().unwrap().has_key_tree);
    // The free-space rebuild sees exactly the reachable records
    assert_eq!(
        db.storage_stats().allocated_records,
        stats_before.allocated_records
    );

    // And the reopened database keeps working
    db.set("bulk/e200", NodeValue::Number(200.0)).unwrap();
    assert_eq!(db.get_value("bulk/e200").unwrap(), NodeValue::Number(200.0));
}

#[test]
fn root_update_and_clear() {
    let db = small_db();
    db.set("", obj(&[("top", NodeValue::Number(1.0))])).unwrap();
    assert_eq!(
        db.get_value("").unwrap(),
        obj(&[("top", NodeValue::Number(1.0))])
    );
    db.remove("").unwrap();
    assert_eq!(db.get_value("").unwrap(), NodeValue::Object(BTreeMap::new()));
    assert!(!db.exists("top").unwrap());
}
