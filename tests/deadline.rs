use std::future::Future;
use std::sync::Arc;
use std::task::{Context as TaskContext, Wake};

use token_gate::{Context, Error, Limiter};
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_burst_then_deadline() {
    let limiter = Limiter::new(1, 2).unwrap();
    let ctx = Context::with_timeout(Duration::from_secs(2));
    let start = Instant::now();

    assert_eq!(
        limiter.wait_n(&ctx, 3).await,
        Err(Error::BurstExceeded {
            requested: 3,
            burst: 2
        })
    );
    assert_eq!(Instant::now(), start);

    limiter.wait_n(&ctx, 2).await.unwrap();
    assert_eq!(Instant::now(), start);

    // Two tokens take exactly the two seconds left, which is too late.
    assert_eq!(limiter.wait_n(&ctx, 2).await, Err(Error::DeadlineExceeded));
    assert_eq!(Instant::now().duration_since(start), Duration::from_secs(2));
    assert_eq!(limiter.balance(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_burst_exceeded_even_when_done() {
    let limiter = Limiter::new(1, 2).unwrap();
    let ctx = Context::background();
    ctx.cancel();

    assert!(matches!(
        limiter.wait_n(&ctx, 3).await,
        Err(Error::BurstExceeded { .. })
    ));
    assert_eq!(limiter.wait_n(&ctx, 1).await, Err(Error::Cancelled));
    assert_eq!(limiter.balance(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_expired_context_fails_fast() {
    let limiter = Limiter::new(1, 2).unwrap();
    let ctx = Context::with_deadline(Instant::now());

    assert_eq!(limiter.wait(&ctx).await, Err(Error::DeadlineExceeded));
    assert_eq!(limiter.balance(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_wait_within_deadline() {
    let limiter = Limiter::new(1, 2).unwrap();
    let ctx = Context::with_timeout(Duration::from_secs(3));
    let start = Instant::now();

    limiter.wait_n(&ctx, 2).await.unwrap();
    limiter.wait_n(&ctx, 2).await.unwrap();

    assert_eq!(Instant::now().duration_since(start), Duration::from_secs(2));
    assert_eq!(limiter.balance(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_cancel_refunds_reservation() {
    let limiter = Limiter::new(1, 2).unwrap();
    let ctx = Context::with_timeout(Duration::from_secs(10));
    let start = Instant::now();

    limiter.wait_n(&ctx, 2).await.unwrap();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    assert_eq!(limiter.wait_n(&ctx, 2).await, Err(Error::Cancelled));
    assert_eq!(
        Instant::now().duration_since(start),
        Duration::from_millis(500)
    );

    // Nothing is left owed to the cancelled wait.
    assert_eq!(limiter.balance(), 0);

    let retry = Context::with_timeout(Duration::from_secs(3));
    limiter.wait_n(&retry, 2).await.unwrap();
    assert_eq!(
        Instant::now().duration_since(start),
        Duration::from_millis(2500)
    );
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_external_token() {
    let token = CancellationToken::new();
    let limiter = Limiter::new(1, 1).unwrap();
    let ctx = Context::with_token(token.child_token());

    limiter.wait(&ctx).await.unwrap();

    let handle = {
        let token = token.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        })
    };

    assert_eq!(limiter.wait(&ctx).await, Err(Error::Cancelled));
    handle.await.unwrap();
    assert_eq!(limiter.balance(), 0);
}

struct NoopWaker;

impl Wake for NoopWaker {
    fn wake(self: Arc<Self>) {}
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_dropped_wait_refunds() {
    let limiter = Limiter::new(1, 3).unwrap();
    let ctx = Context::background();

    limiter.wait_n(&ctx, 3).await.unwrap();

    let waker = Arc::new(NoopWaker).into();
    let mut cx = TaskContext::from_waker(&waker);

    let mut wait = Box::pin(limiter.wait_n(&ctx, 2));
    assert!(wait.as_mut().poll(&mut cx).is_pending());
    assert_eq!(limiter.balance(), -2);

    drop(wait);
    assert_eq!(limiter.balance(), 0);
}
