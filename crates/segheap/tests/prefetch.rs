//! Background prefetch thread tests.

use std::sync::Arc;
use std::time::Duration;

use segheap::{CancellationToken, PrefetchOutcome, Prefetcher};

#[test]
fn test_prefetch_completes() {
    let page = sys_alloc::page_size();
    let buffer: Arc<[u8]> = vec![1u8; 16 * page].into();
    let prefetcher = Prefetcher::spawn(buffer, CancellationToken::new()).unwrap();
    assert!(prefetcher.wait_for_completion(Duration::from_secs(30)));
    match prefetcher.stop() {
        Some(PrefetchOutcome::Completed { pages }) => assert_eq!(pages, 16),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_cancelled_token_stops_early() {
    let token = CancellationToken::new();
    token.cancel();
    let buffer: Arc<[u8]> = vec![0u8; 256 * sys_alloc::page_size()].into();
    let prefetcher = Prefetcher::spawn(buffer, token).unwrap();
    assert!(prefetcher.wait_for_completion(Duration::from_secs(30)));
    assert_eq!(
        prefetcher.stop(),
        Some(PrefetchOutcome::Cancelled { pages: 0 })
    );
}

#[test]
fn test_stop_is_idempotent() {
    let buffer: Arc<[u8]> = vec![0u8; 4].into();
    let prefetcher = Prefetcher::spawn(buffer, CancellationToken::new()).unwrap();
    assert!(prefetcher.stop().is_some());
    assert!(prefetcher.stop().is_none());
    assert!(prefetcher.token().is_cancelled());
    assert!(prefetcher.wait_for_completion(Duration::ZERO));
}
