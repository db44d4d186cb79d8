mod fixtures;

use fixtures::*;
use std::sync::Arc;
use stratum_buffer::BufferPool;
use stratum_crypto::*;

#[test]
fn test_encrypt_decrypt_through_executor() {
    let pool = BufferPool::new();
    let executor = CryptoJobExecutor::new(2, pool.clone()).unwrap();
    let cipher = setup_cipher();

    let (job, rx) = job(pool.copy_from_slice(b"chunk payload"), cipher.encryptor(), b"blob/0");
    executor.submit(job);
    let sealed = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap().extract();

    let (job, rx) = fixtures::job(sealed, cipher.decryptor(), b"blob/0");
    executor.submit(job);
    let opened = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap().extract();

    assert_eq!(&*opened, b"chunk payload");
    opened.release();
    executor.shutdown();
    assert_eq!(executor.stats().succeeded, 2);
    assert!(pool.is_quiescent());
}

#[test]
fn test_wrong_associated_data_fails_and_releases() {
    let pool = BufferPool::new();
    let executor = CryptoJobExecutor::new(1, pool.clone()).unwrap();
    let cipher = setup_cipher();
    let sealed = cipher.seal(&pool, b"bound", b"blob/0").unwrap().freeze();

    let (job, rx) = job(sealed, cipher.decryptor(), b"blob/1");
    executor.submit(job);

    let result = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(matches!(result, Err(CryptoError::Decryption { .. })));
    executor.shutdown();
    assert_eq!(executor.stats().failed, 1);
    assert!(pool.is_quiescent());
}

#[test]
fn test_failure_after_alloc_releases_output_and_input() {
    let pool = BufferPool::new();
    let executor = CryptoJobExecutor::new(1, pool.clone()).unwrap();

    let (job, rx) = job(pool.from_vec(vec![3; 64]), Arc::new(FailsAfterAlloc), b"");
    executor.submit(job);

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap().is_err());
    let stats = pool.stats();
    assert_eq!(stats.allocated, 2, "input and partial output");
    assert_eq!(stats.freed, 2);
    assert!(pool.is_quiescent());
}

#[test]
fn test_close_job_before_run_releases_once() {
    let pool = BufferPool::new();
    let executor = CryptoJobExecutor::new(1, pool.clone()).unwrap();
    let cipher = setup_cipher();

    let (job, rx) = job(pool.copy_from_slice(b"never runs"), cipher.encryptor(), b"");
    executor.close_job(job, "operation cancelled");

    let err = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap_err();
    assert!(err.is_aborted());
    assert_eq!(pool.stats().released, 1);
    assert!(pool.is_quiescent());
    assert_eq!(executor.stats().closed, 1);
}

#[test]
fn test_shutdown_closes_queued_jobs() {
    let pool = BufferPool::new();
    let executor = CryptoJobExecutor::new(1, pool.clone()).unwrap();
    let gate = Arc::new(Gate::default());
    let transform: Arc<dyn CryptoTransform> = Arc::new(GatedCopy(Arc::clone(&gate)));

    let (running, running_rx) = job(pool.copy_from_slice(b"running"), Arc::clone(&transform), b"");
    executor.submit(running);
    while executor.queued() > 0 {
        std::thread::yield_now();
    }

    let receivers: Vec<_> = (0..4)
        .map(|i| {
            let (job, rx) = job(pool.from_vec(vec![i; 8]), Arc::clone(&transform), b"");
            executor.submit(job);
            rx
        })
        .collect();

    let releaser = {
        let gate = Arc::clone(&gate);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            gate.open();
        })
    };
    executor.shutdown();
    releaser.join().unwrap();

    for rx in receivers {
        assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap_err().is_aborted());
    }
    let finished = running_rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert!(finished.discard());
    assert_eq!(executor.stats().closed, 4);
    assert!(pool.is_quiescent());
}

#[test]
fn test_submit_after_shutdown_is_closed() {
    let pool = BufferPool::new();
    let executor = CryptoJobExecutor::new(1, pool.clone()).unwrap();
    executor.shutdown();

    let (job, rx) = job(pool.copy_from_slice(b"late"), setup_cipher().encryptor(), b"");
    executor.submit(job);

    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap_err().is_aborted());
    assert!(pool.is_quiescent());
}

#[test]
fn test_dropping_executor_closes_pending_work() {
    let pool = BufferPool::new();
    let gate = Arc::new(Gate::default());
    let transform: Arc<dyn CryptoTransform> = Arc::new(GatedCopy(Arc::clone(&gate)));
    let executor = CryptoJobExecutor::new(1, pool.clone()).unwrap();

    let (first, first_rx) = job(pool.copy_from_slice(b"a"), Arc::clone(&transform), b"");
    let (second, second_rx) = job(pool.copy_from_slice(b"b"), transform, b"");
    executor.submit(first);
    executor.submit(second);
    gate.open();
    drop(executor);

    let outcomes = [first_rx.recv_timeout(RECV_TIMEOUT).unwrap(), second_rx.recv_timeout(RECV_TIMEOUT).unwrap()];
    for outcome in outcomes {
        match outcome {
            Ok(result) => drop(result.extract()),
            Err(err) => assert!(err.is_aborted()),
        }
    }
    assert!(pool.is_quiescent());
}
