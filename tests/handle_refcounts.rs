//! Property tests for handle-table reference counting
//!
//! The counts must be conservative: a value produced once is freed exactly
//! once no matter how releases interleave, and releasing unknown or
//! already-freed handles is always a no-op.

use opflow::handles::HandleTable;
use opflow::types::TensorValue;
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Action {
    Put { op_id: i64, output: u32 },
    Release { op_id: i64, output: u32 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0i64..5, 0u32..2).prop_map(|(op_id, output)| Action::Put { op_id, output }),
        (0i64..5, 0u32..2).prop_map(|(op_id, output)| Action::Release { op_id, output }),
    ]
}

proptest! {
    /// The table holds exactly the slots that were produced and not yet
    /// released, and production is at-most-once for the table's lifetime,
    /// under any action sequence.
    #[test]
    fn refcounts_match_model(actions in proptest::collection::vec(action_strategy(), 0..64)) {
        let table = HandleTable::new();
        let mut live: HashSet<(i64, u32)> = HashSet::new();
        let mut ever_produced: HashSet<(i64, u32)> = HashSet::new();

        for action in actions {
            match action {
                Action::Put { op_id, output } => {
                    let result = table.put(op_id, output, TensorValue::scalar_f64(1.0));
                    // A slot is producible exactly once, even after release.
                    prop_assert_eq!(result.is_ok(), ever_produced.insert((op_id, output)));
                    if result.is_ok() {
                        live.insert((op_id, output));
                    }
                }
                Action::Release { op_id, output } => {
                    table.release(op_id, output);
                    live.remove(&(op_id, output));
                }
            }
        }

        prop_assert_eq!(table.len(), live.len());
        for (op_id, output) in &live {
            prop_assert!(table.resolve(*op_id, *output).is_ok());
        }
    }

    /// Put followed by exactly one release frees the slot; every further
    /// release of the same slot is a no-op.
    #[test]
    fn single_reference_frees_exactly_once(extra_releases in 0usize..8) {
        let table = HandleTable::new();
        table.put(1, 0, TensorValue::scalar_f64(7.0)).unwrap();

        table.release(1, 0);
        prop_assert!(table.resolve(1, 0).is_err());

        for _ in 0..extra_releases {
            table.release(1, 0);
        }
        prop_assert!(table.is_empty());
    }
}
