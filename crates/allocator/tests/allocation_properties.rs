//! Property test for Testable Property 4 ("allocator uniqueness"): for
//! any basename, the multiset of allocated `seq` values never contains a
//! duplicate, across an arbitrary interleaving of allocate/free calls.

use std::sync::Arc;

use proptest::prelude::*;

use uds_allocator::UniqueIdAllocator;
use uds_store::MemoryStore;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    Free(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        1 => (0u8..20).prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn no_two_live_allocations_ever_share_a_seq(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let alloc = UniqueIdAllocator::new(Arc::new(MemoryStore::new()));
            let mut held: Vec<u64> = Vec::new();

            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Allocate => {
                        if let Some(seq) = alloc
                            .allocate(&format!("owner-{i}"), "basename", (0, 19))
                            .await
                            .unwrap()
                        {
                            prop_assert!(
                                !held.contains(&seq),
                                "seq {seq} allocated while already held by another owner"
                            );
                            held.push(seq);
                        }
                    }
                    Op::Free(seq) => {
                        let seq = seq as u64;
                        if let Some(pos) = held.iter().position(|&s| s == seq) {
                            held.remove(pos);
                        }
                        alloc.free("basename", seq).await.unwrap();
                    }
                }
            }
            Ok(())
        })?;
    }
}
