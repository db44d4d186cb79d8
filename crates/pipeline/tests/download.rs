mod fixtures;

use fixtures::*;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use stratum_channel::{ChunkTransferChannel, Taken};
use stratum_pipeline::*;

#[test]
fn test_composite_round_trip() {
    let harness = sealed_harness();
    let bytes = payload(5 * CHUNK + 17);
    let blob_id = upload(&harness, &bytes, 100).unwrap();

    let (summary, sink) = download(&harness, &blob_id, ByteRange::full());
    let summary = summary.unwrap();

    assert_eq!(sink.bytes(), bytes);
    assert_eq!(sink.indices(), vec![0, 1, 2, 3, 4, 5]);
    assert!(sink.ended());
    assert_eq!(summary.total_size, bytes.len() as u64);
    assert_eq!(summary.bytes_delivered, bytes.len() as u64);
    assert_eq!(summary.chunks_delivered, 6);
    assert_quiescent(&harness.pool);
}

#[test]
fn test_range_fetches_only_overlapping_chunks() {
    let harness = sealed_harness();
    let bytes = payload(6 * CHUNK);
    let blob_id = upload(&harness, &bytes, CHUNK).unwrap();

    let start = CHUNK + 10;
    let len = CHUNK + 4;
    let (summary, sink) = download(&harness, &blob_id, ByteRange::new(start as u64, len as u64));

    assert_eq!(summary.unwrap().bytes_delivered, len as u64);
    assert_eq!(sink.bytes(), bytes[start..start + len]);
    assert_eq!(sink.indices(), vec![1, 2]);
    assert_eq!(harness.transport.fetches(), 3, "root and two data chunks");
    assert_quiescent(&harness.pool);
}

#[test]
fn test_open_ended_range_reads_to_the_end() {
    let harness = harness(config(), |builder| builder);
    let bytes = payload(3 * CHUNK + 3);
    let blob_id = upload(&harness, &bytes, 64).unwrap();

    let (summary, sink) = download(&harness, &blob_id, ByteRange::from_offset(2 * CHUNK as u64 + 1));

    assert!(summary.is_ok());
    assert_eq!(sink.bytes(), bytes[2 * CHUNK + 1..]);
    assert_quiescent(&harness.pool);
}

#[test]
fn test_simple_blob_range() {
    let harness = sealed_harness();
    let bytes = payload(40);
    let blob_id = upload(&harness, &bytes, 40).unwrap();

    let (summary, sink) = download(&harness, &blob_id, ByteRange::new(5, 10));

    assert_eq!(summary.unwrap().chunks_delivered, 1);
    assert_eq!(sink.bytes(), bytes[5..15]);
    assert_eq!(harness.transport.fetches(), 1);
    assert_quiescent(&harness.pool);
}

#[test]
fn test_empty_range_at_end_delivers_nothing() {
    let harness = sealed_harness();
    let blob_id = upload(&harness, &payload(20), 20).unwrap();

    let (summary, sink) = download(&harness, &blob_id, ByteRange::new(20, 0));

    assert_eq!(summary.unwrap().bytes_delivered, 0);
    assert!(sink.indices().is_empty());
    assert!(sink.ended());
    assert_quiescent(&harness.pool);
}

#[test]
fn test_empty_blob_downloads_empty() {
    let harness = sealed_harness();
    let blob_id = upload(&harness, &[], 1).unwrap();

    let (summary, sink) = download(&harness, &blob_id, ByteRange::full());

    assert_eq!(summary.unwrap().total_size, 0);
    assert!(sink.bytes().is_empty());
    assert_quiescent(&harness.pool);
}

#[test]
fn test_range_past_end_is_rejected() {
    let harness = sealed_harness();
    let blob_id = upload(&harness, &payload(2 * CHUNK), CHUNK).unwrap();

    let (result, sink) = download(&harness, &blob_id, ByteRange::new(2 * CHUNK as u64, 1));

    assert_eq!(result.unwrap_err().kind(), "InvalidRange");
    assert!(!sink.ended());
    assert_quiescent(&harness.pool);
}

#[test]
fn test_unknown_blob_is_not_found() {
    let harness = sealed_harness();

    let (result, _) = download(&harness, &BlobId::generate(), ByteRange::full());

    assert_eq!(result.unwrap_err().kind(), "NotFound");
    assert_quiescent(&harness.pool);
}

#[test]
fn test_one_fetch_in_flight_still_delivers_in_order() {
    let config = PipelineConfig { max_parallel_fetches: 1, ..config() };
    let cipher = setup_cipher();
    let harness = harness(config, |builder| builder.cipher(&cipher));
    let bytes = payload(8 * CHUNK - 1);
    let blob_id = upload(&harness, &bytes, 33).unwrap();

    let (summary, sink) = download(&harness, &blob_id, ByteRange::full());

    assert!(summary.is_ok());
    assert_eq!(sink.bytes(), bytes);
    assert_eq!(sink.indices(), (0..8).collect::<Vec<_>>());
    assert_quiescent(&harness.pool);
}

#[test]
fn test_download_into_channel() {
    let harness = sealed_harness();
    let bytes = payload(4 * CHUNK);
    let blob_id = upload(&harness, &bytes, 50).unwrap();

    let channel = ChunkTransferChannel::new();
    let consumer = {
        let channel = channel.clone();
        thread::spawn(move || {
            let mut received = Vec::new();
            loop {
                match channel.take(Duration::from_secs(5)).unwrap() {
                    Taken::Buffer(buffer) => {
                        received.extend_from_slice(&buffer);
                        buffer.release();
                        channel.acknowledge(None);
                    },
                    Taken::Finished => return received,
                    Taken::Timeout => panic!("download stalled"),
                }
            }
        })
    };

    let handle = harness.pipeline.download(&blob_id, ByteRange::full(), Arc::new(channel)).unwrap();
    let summary = handle.wait().unwrap();

    assert_eq!(summary.chunks_delivered, 4);
    assert_eq!(consumer.join().unwrap(), bytes);
    assert_quiescent(&harness.pool);
}

#[test]
fn test_cancelled_download_releases_parked_chunks() {
    let harness = sealed_harness();
    let blob_id = upload(&harness, &payload(6 * CHUNK), CHUNK).unwrap();
    harness.transport.set_delay(Some(Duration::from_millis(50)));

    let sink = Arc::new(CollectingSink::default());
    let handle = harness.pipeline.download(&blob_id, ByteRange::full(), sink.clone()).unwrap();
    handle.cancel();

    assert_eq!(handle.wait().unwrap_err().kind(), "Cancelled");
    assert!(!sink.ended());
    assert_quiescent(&harness.pool);
}

#[test]
fn test_cancel_releases_chunks_parked_behind_a_blocked_sink() {
    let harness = sealed_harness();
    let blob_id = upload(&harness, &payload(6 * CHUNK), CHUNK).unwrap();
    assert_quiescent(&harness.pool);

    // Own executor, so its counters only see this download's decryptions.
    let cipher = setup_cipher();
    let pipeline = Pipeline::builder(harness.transport.clone())
        .config(config())
        .pool(harness.pool.clone())
        .cipher(&cipher)
        .build()
        .unwrap();
    let window = pipeline.config().max_parallel_fetches as u64;

    let sink = Arc::new(GatedSink::default());
    let handle = pipeline.download(&blob_id, ByteRange::full(), sink.clone()).unwrap();
    assert!(sink.wait_entered(SETTLE));
    assert!(wait_until(SETTLE, || pipeline.executor().stats().succeeded == window));

    // Chunk 0 is held in the sink; everything else in the window is parked.
    assert_eq!(harness.pool.stats().live_allocations(), window - 1);
    handle.cancel();
    sink.open();

    assert_eq!(handle.wait().unwrap_err().kind(), "Cancelled");
    assert!(wait_until(SETTLE, || sink.delivered.load(Ordering::SeqCst) == 1));
    assert_eq!(harness.transport.fetches(), 1 + window);
    assert_quiescent(&harness.pool);
}

#[test]
fn test_download_into_bounded_channel_waits_for_consumer() {
    let harness = sealed_harness();
    let bytes = payload(8 * CHUNK);
    let blob_id = upload(&harness, &bytes, CHUNK).unwrap();

    let channel = ChunkTransferChannel::with_capacity(2).unwrap();
    let consumer = {
        let channel = channel.clone();
        thread::spawn(move || {
            let mut received = Vec::new();
            let mut most_pending = 0;
            loop {
                thread::sleep(Duration::from_millis(10));
                most_pending = most_pending.max(channel.pending());
                match channel.take(Duration::from_secs(5)).unwrap() {
                    Taken::Buffer(buffer) => {
                        received.extend_from_slice(&buffer);
                        buffer.release();
                        channel.acknowledge(None);
                    },
                    Taken::Finished => return (received, most_pending),
                    Taken::Timeout => panic!("download stalled"),
                }
            }
        })
    };

    let handle =
        harness.pipeline.download(&blob_id, ByteRange::full(), Arc::new(channel.clone())).unwrap();
    let summary = handle.wait().unwrap();

    let (received, most_pending) = consumer.join().unwrap();
    assert_eq!(summary.chunks_delivered, 8);
    assert_eq!(received, bytes);
    assert!(most_pending <= channel.capacity(), "pending reached {most_pending}");
    assert_quiescent(&harness.pool);
}

#[test]
fn test_download_into_unread_channel_times_out() {
    let cipher = setup_cipher();
    let harness =
        harness(PipelineConfig { operation_timeout_ms: 500, ..config() }, |builder| {
            builder.cipher(&cipher)
        });
    let blob_id = upload(&harness, &payload(8 * CHUNK), CHUNK).unwrap();

    let channel = ChunkTransferChannel::with_capacity(2).unwrap();
    let handle =
        harness.pipeline.download(&blob_id, ByteRange::full(), Arc::new(channel.clone())).unwrap();

    assert_eq!(handle.wait().unwrap_err().kind(), "Timeout");
    assert!(channel.is_closed());
    assert_eq!(channel.pending(), 0);
    assert_quiescent(&harness.pool);
}

#[tokio::test]
async fn test_download_handle_is_a_future() {
    let harness = sealed_harness();
    let bytes = payload(2 * CHUNK + 1);
    let UploadStream { channel, handle } = harness.pipeline.upload().unwrap();
    channel.write_with_callback(harness.pool.copy_from_slice(&bytes), |_| {});
    channel.finish();
    let blob_id = handle.await.unwrap();

    let sink = Arc::new(CollectingSink::default());
    let summary = harness.pipeline.download(&blob_id, ByteRange::full(), sink.clone()).unwrap().await;

    assert_eq!(summary.unwrap().bytes_delivered, bytes.len() as u64);
    assert_eq!(sink.bytes(), bytes);
    assert_quiescent(&harness.pool);
}
