use proptest::prelude::*;
use stratum_buffer::{Buffer, BufferPool};

#[derive(Debug, Clone)]
enum Op {
    Retain(usize),
    Slice(usize, usize, usize),
    Split(usize, usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<usize>().prop_map(Op::Retain),
        (any::<usize>(), 0usize..64, 0usize..64).prop_map(|(i, s, l)| Op::Slice(i, s, l)),
        (any::<usize>(), 0usize..64).prop_map(|(i, at)| Op::Split(i, at)),
        any::<usize>().prop_map(Op::Release),
    ]
}

proptest! {
    #[test]
    fn arbitrary_handle_sequences_balance(
        sizes in prop::collection::vec(0usize..64, 1..4),
        ops in prop::collection::vec(op(), 0..64),
    ) {
        let pool = BufferPool::new();
        let mut live: Vec<Buffer> = sizes.iter().map(|n| pool.from_vec(vec![0xAB; *n])).collect();

        for op in ops {
            if live.is_empty() {
                break;
            }
            match op {
                Op::Retain(i) => {
                    let copy = live[i % live.len()].retain();
                    live.push(copy);
                }
                Op::Slice(i, start, len) => {
                    if let Ok(slice) = live[i % live.len()].slice(start, len) {
                        prop_assert_eq!(slice.readable_bytes(), len);
                        live.push(slice);
                    }
                }
                Op::Split(i, at) => {
                    let index = i % live.len();
                    let before = live[index].readable_bytes();
                    if let Ok(head) = live[index].split_to(at) {
                        prop_assert_eq!(head.readable_bytes() + live[index].readable_bytes(), before);
                        live.push(head);
                    }
                }
                Op::Release(i) => {
                    let index = i % live.len();
                    live.swap_remove(index).release();
                }
            }

            let stats = pool.stats();
            prop_assert_eq!(stats.live_handles(), live.len() as u64);
        }

        for buffer in live {
            buffer.release();
        }
        prop_assert!(pool.is_quiescent());
        let stats = pool.stats();
        prop_assert_eq!(stats.allocated, sizes.len() as u64);
        prop_assert_eq!(stats.acquired, stats.released);
    }
}

#[test]
fn last_release_reports_free() {
    let pool = BufferPool::new();
    let buffer = pool.copy_from_slice(b"0123");
    let handles: Vec<_> = (0..4).map(|_| buffer.retain()).collect();

    assert_eq!(buffer.ref_count(), 5);
    let freed: Vec<bool> = std::iter::once(buffer).chain(handles).map(Buffer::release).collect();
    assert_eq!(freed, vec![false, false, false, false, true]);
}
