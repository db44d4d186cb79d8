mod fixtures;

use fixtures::*;
use proptest::prelude::*;
use stratum_pipeline::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn roundtrip_arbitrary_blobs(
        data in proptest::collection::vec(any::<u8>(), 0..6 * CHUNK),
        piece in 1usize..100,
    ) {
        let harness = sealed_harness();
        let blob_id = upload(&harness, &data, piece).unwrap();

        let (summary, sink) = download(&harness, &blob_id, ByteRange::full());

        prop_assert_eq!(summary.unwrap().total_size, data.len() as u64);
        prop_assert_eq!(sink.bytes(), data);
        prop_assert!(wait_quiescent(&harness.pool, SETTLE));
    }

    #[test]
    fn range_matches_slice(
        len in 1usize..5 * CHUNK,
        start_pct in 0u64..100,
        len_pct in 0u64..=100,
    ) {
        let harness = harness(config(), |builder| builder);
        let data = payload(len);
        let blob_id = upload(&harness, &data, 37).unwrap();

        let total = len as u64;
        let start = total * start_pct / 100;
        let length = (total - start) * len_pct / 100;
        let (summary, sink) = download(&harness, &blob_id, ByteRange::new(start, length));

        let (start, end) = (usize::try_from(start).unwrap(), usize::try_from(start + length).unwrap());
        prop_assert_eq!(summary.unwrap().bytes_delivered, length);
        prop_assert_eq!(sink.bytes(), data[start..end].to_vec());
        prop_assert!(wait_quiescent(&harness.pool, SETTLE));
    }
}
