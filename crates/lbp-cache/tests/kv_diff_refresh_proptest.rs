//! Property tests for [`lbp_cache::Cache`]'s swap-on-refresh behavior: after
//! [`Cache::process_tick`], the snapshot always matches exactly the set of
//! keys currently present under the cache's prefix in the store, no matter
//! how many inserts/deletes happened between ticks.

use lbp_cache::Cache;
use lbp_store::mock::MockStore;
use lbp_store::Store;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Set(String),
    Delete(String),
}

fn arb_op() -> impl Strategy<Value = Op> {
    let key = "[a-c]";
    prop_oneof![
        key.prop_map(Op::Set),
        key.prop_map(Op::Delete),
    ]
}

proptest! {
    #[test]
    fn snapshot_after_tick_matches_store_exactly(ops in prop::collection::vec(arb_op(), 0..30)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store: Arc<dyn Store> = Arc::new(MockStore::new());
            let cache = Cache::new(Arc::clone(&store), "scoped");
            let mut expected: HashSet<String> = HashSet::new();

            for op in ops {
                match op {
                    Op::Set(k) => {
                        store.set_kv("scoped", &k, serde_json::json!(true)).await.unwrap();
                        expected.insert(k);
                    }
                    Op::Delete(k) => {
                        store.delete_kv("scoped", &k).await.unwrap();
                        expected.remove(&k);
                    }
                }
            }

            cache.process_tick().await.unwrap();
            let snapshot = cache.snapshot();
            let actual: HashSet<String> = snapshot.keys().cloned().collect();
            prop_assert_eq!(actual, expected);
            Ok(())
        })?;
    }

    #[test]
    fn keys_outside_the_prefix_never_appear(
        scoped_ops in prop::collection::vec(arb_op(), 0..15),
        other_ops in prop::collection::vec(arb_op(), 0..15),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store: Arc<dyn Store> = Arc::new(MockStore::new());
            let cache = Cache::new(Arc::clone(&store), "scoped");

            for op in scoped_ops {
                if let Op::Set(k) = op {
                    store.set_kv("scoped", &k, serde_json::json!(1)).await.unwrap();
                }
            }
            for op in other_ops {
                if let Op::Set(k) = op {
                    store.set_kv("other", &k, serde_json::json!(2)).await.unwrap();
                }
            }

            cache.process_tick().await.unwrap();
            let snapshot = cache.snapshot();
            for entry in snapshot.values() {
                prop_assert_eq!(&entry.prefix, "scoped");
            }
            Ok(())
        })?;
    }
}
