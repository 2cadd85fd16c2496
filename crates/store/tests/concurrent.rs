use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kmirror_core::DynamicObject;
use kmirror_store::{default_indexers, Store};
use kube::core::ObjectMeta;

const WRITERS: usize = 4;
const ROUNDS: usize = 500;
const SLOTS: usize = 16;

fn colored(name: &str, color: &str) -> Arc<DynamicObject> {
    Arc::new(DynamicObject {
        types: None,
        metadata: ObjectMeta { namespace: Some("a".into()), name: Some(name.into()), ..Default::default() },
        data: serde_json::json!({ "color": color }),
    })
}

fn color_of(obj: &DynamicObject) -> &str {
    obj.data.get("color").and_then(|v| v.as_str()).unwrap_or("")
}

fn store() -> Store {
    let indexers = default_indexers().with("color", |o: &DynamicObject| {
        Ok(Some(color_of(o)).filter(|c| !c.is_empty()).map(str::to_string).into_iter().collect())
    });
    Store::new("widget", indexers)
}

#[test]
fn readers_never_see_stale_index_entries() {
    let store = store();
    let done = AtomicBool::new(false);

    std::thread::scope(|s| {
        let writers: Vec<_> = (0..WRITERS)
            .map(|w| {
                let store = &store;
                s.spawn(move || {
                    for i in 0..ROUNDS {
                        let name = format!("w{}-{}", w, i % SLOTS);
                        let key = format!("a/{}", name);
                        let color = if i % 2 == 0 { "red" } else { "blue" };
                        store.put(key.clone(), colored(&name, color));
                        if i % 7 == 0 {
                            store.delete(&key);
                        }
                    }
                })
            })
            .collect();
        for _ in 0..2 {
            let (store, done) = (&store, &done);
            s.spawn(move || {
                while !done.load(Ordering::Relaxed) {
                    for color in ["red", "blue"] {
                        for o in store.by_index("color", color).unwrap() {
                            assert_eq!(color_of(&o), color, "object filed under the wrong bucket");
                        }
                    }
                    for o in store.by_namespace("a") {
                        assert_eq!(o.metadata.namespace.as_deref(), Some("a"));
                    }
                }
            });
        }
        for w in writers {
            w.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
    });

    // settled: buckets partition the primary map exactly
    let red = store.index_keys("color", "red").unwrap();
    let blue = store.index_keys("color", "blue").unwrap();
    assert_eq!(red.len() + blue.len(), store.len());
    for key in red.iter().chain(&blue) {
        assert!(store.contains(key), "index points at missing key {}", key);
    }
    assert_eq!(store.by_namespace("a").len(), store.len());
}

#[test]
fn deleting_everything_empties_every_bucket() {
    let store = store();
    for i in 0..SLOTS {
        let name = format!("o{}", i);
        store.put(format!("a/{}", name), colored(&name, "red"));
    }
    for key in store.list_keys() {
        store.delete(&key);
    }
    assert!(store.is_empty());
    assert!(store.index_values("color").unwrap().is_empty());
    assert!(store.index_values("namespace").unwrap().is_empty());
}
