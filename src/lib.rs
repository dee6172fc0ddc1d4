//! A token bucket rate limiter with reservations.
//!
//! A [`Limiter`] holds up to `burst` tokens, and regains them at a steady
//! `rate` of tokens per second. Callers ask for `n` tokens at a time through
//! [`Limiter::wait_n`], which admits them immediately if the tokens are
//! available, or suspends them until enough tokens have accrued.
//!
//! Every wait is bounded by a [`Context`] carrying an optional deadline and a
//! cancellation token. A request which cannot be satisfied before the deadline
//! is never admitted, and a wait which is cancelled refunds the tokens it had
//! reserved so that other callers can make use of them.
//!
//! Since this crate uses timing facilities from tokio it has to be used within
//! a Tokio runtime with the [`time` feature] enabled.
//!
//! <br>
//!
//! ## Usage
//!
//! ```
//! use token_gate::{Context, Error, Limiter};
//! use tokio::time::Duration;
//!
//! # #[tokio::main(flavor="current_thread", start_paused=true)] async fn main() -> token_gate::Result<()> {
//! let limiter = Limiter::new(1, 2)?;
//! let ctx = Context::with_timeout(Duration::from_secs(2));
//!
//! // Never satisfiable, the bucket only holds two tokens.
//! assert!(matches!(limiter.wait_n(&ctx, 3).await, Err(Error::BurstExceeded { .. })));
//!
//! // The bucket starts full, so this is instantaneous.
//! limiter.wait_n(&ctx, 2).await?;
//!
//! // Refilling two tokens takes exactly as long as the remaining deadline,
//! // which is not soon enough.
//! assert_eq!(limiter.wait_n(&ctx, 2).await, Err(Error::DeadlineExceeded));
//! # Ok(()) }
//! ```
//!
//! <br>
//!
//! ## Implementation details
//!
//! The limiter keeps a single ledger behind a mutex: the token balance, the
//! instant it was last recomputed, and the instant at which the most recently
//! granted reservation completes. The lock is held only while reserving or
//! refunding tokens and never while a caller sleeps.
//!
//! Reserving tokens may drive the balance negative. The debt is repaid by
//! future accrual, and the reservation tells its caller how long that takes.
//! Accrual is truncated to whole tokens, while the time to repay a debt is
//! rounded up to the nanosecond, so a caller is never woken up before its
//! tokens exist.
//!
//! [`time` feature]: https://docs.rs/tokio/1/tokio/#feature-flags

#![deny(missing_docs)]

use core::time::Duration;
use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

mod context;
mod error;
mod reservation;

pub use self::context::{Context, Done};
pub use self::error::{Error, Result};
pub use self::reservation::Reservation;
use self::reservation::RefundGuard;

/// The maximum supported balance.
const MAX_BALANCE: u64 = i64::MAX as u64;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Tokens accrued at `rate` over `elapsed`, truncated toward zero.
fn tokens_from_duration(rate: u64, elapsed: Duration) -> i64 {
    let tokens = elapsed.as_nanos().saturating_mul(u128::from(rate)) / NANOS_PER_SEC;
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

/// Time needed to accrue `tokens` at `rate`, rounded up to the nanosecond.
fn duration_from_tokens(rate: u64, tokens: u64) -> Duration {
    let nanos = (u128::from(tokens) * NANOS_PER_SEC).div_ceil(u128::from(rate));
    Duration::new(
        (nanos / NANOS_PER_SEC) as u64,
        (nanos % NANOS_PER_SEC) as u32,
    )
}

#[derive(Debug)]
struct LimiterConfig {
    /// Tokens accrued per second.
    rate: u64,
    /// Capacity of the bucket, and the largest admissible request.
    burst: u64,
}

impl LimiterConfig {
    fn max_balance(&self) -> i64 {
        // burst is validated against MAX_BALANCE on construction.
        self.burst as i64
    }
}

#[derive(Debug)]
struct LimiterState {
    /// Token balance as of `last`. Negative while reservations are in debt.
    tokens: i64,
    /// Last time `tokens` was recomputed. Never moves backward.
    last: Instant,
    /// When the most recently granted reservation may act.
    last_event: Instant,
}

impl LimiterState {
    /// The balance as of `now`, along with the instant it is valid at.
    ///
    /// Nothing is committed. An instant earlier than `last` accrues nothing.
    fn advance(&self, config: &LimiterConfig, now: Instant) -> (i64, Instant) {
        let now = now.max(self.last);
        let accrued = tokens_from_duration(config.rate, now - self.last);
        let tokens = self
            .tokens
            .saturating_add(accrued)
            .min(config.max_balance());
        (tokens, now)
    }
}

/// A token bucket rate limiter.
///
/// See the [crate level documentation](crate) for an overview.
#[derive(Debug)]
pub struct Limiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
}

impl Limiter {
    /// Construct a limiter regaining `rate` tokens per second and holding up
    /// to `burst` tokens. The bucket starts full.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::InvalidConfiguration`] if either value is zero or
    /// the burst exceeds the maximum supported balance.
    ///
    /// # Examples
    ///
    /// ```
    /// use token_gate::{Error, Limiter};
    ///
    /// let limiter = Limiter::new(10, 100)?;
    /// assert_eq!(limiter.rate(), 10);
    /// assert_eq!(limiter.burst(), 100);
    ///
    /// assert!(matches!(Limiter::new(0, 1), Err(Error::InvalidConfiguration(..))));
    /// # Ok::<_, Error>(())
    /// ```
    pub fn new(rate: u64, burst: u64) -> Result<Self> {
        Self::builder().rate(rate).burst(burst).build()
    }

    /// Construct a new [`Builder`] for a [`Limiter`].
    ///
    /// # Examples
    ///
    /// ```
    /// use token_gate::Limiter;
    ///
    /// let limiter = Limiter::builder()
    ///     .rate(100)
    ///     .burst(1000)
    ///     .build()?;
    /// # Ok::<_, token_gate::Error>(())
    /// ```
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Tokens regained per second.
    pub fn rate(&self) -> u64 {
        self.config.rate
    }

    /// The maximum number of tokens the bucket holds.
    pub fn burst(&self) -> u64 {
        self.config.burst
    }

    /// Get the current token balance.
    ///
    /// A negative balance is owed to reservations which have not yet reached
    /// their act time.
    ///
    /// # Examples
    ///
    /// ```
    /// use token_gate::{Context, Limiter};
    ///
    /// # #[tokio::main(flavor="current_thread", start_paused=true)] async fn main() -> token_gate::Result<()> {
    /// let limiter = Limiter::new(1, 100)?;
    ///
    /// assert_eq!(limiter.balance(), 100);
    /// limiter.wait_n(&Context::background(), 10).await?;
    /// assert_eq!(limiter.balance(), 90);
    /// # Ok(()) }
    /// ```
    pub fn balance(&self) -> i64 {
        self.balance_at(Instant::now())
    }

    /// Get the token balance as of `now`, without modifying the limiter.
    pub fn balance_at(&self, now: Instant) -> i64 {
        self.state.lock().advance(&self.config, now).0
    }

    /// Reserve `n` tokens as of `now`.
    ///
    /// The reservation is granted if `n` does not exceed the burst and the
    /// tokens become available strictly sooner than `max_wait`. A `max_wait`
    /// of `None` places no bound on the wait.
    ///
    /// A granted reservation takes its tokens from the limiter immediately.
    /// A rejected one leaves the limiter untouched.
    ///
    /// # Examples
    ///
    /// ```
    /// use token_gate::Limiter;
    /// use tokio::time::{Duration, Instant};
    ///
    /// # #[tokio::main(flavor="current_thread", start_paused=true)] async fn main() -> token_gate::Result<()> {
    /// let limiter = Limiter::new(1, 1)?;
    /// let now = Instant::now();
    ///
    /// // The wait has to be strictly shorter than `max_wait`.
    /// assert!(!limiter.reserve_n(now, 1, Some(Duration::ZERO)).is_granted());
    /// assert!(limiter.reserve_n(now, 1, None).is_granted());
    /// assert!(!limiter.reserve_n(now, 1, Some(Duration::from_secs(1))).is_granted());
    /// # Ok(()) }
    /// ```
    pub fn reserve_n(&self, now: Instant, n: u64, max_wait: Option<Duration>) -> Reservation<'_> {
        let mut state = self.state.lock();
        let (balance, now) = state.advance(&self.config, now);

        let requested = i64::try_from(n).unwrap_or(i64::MAX);
        let balance = balance.saturating_sub(requested);

        let wait = if balance < 0 {
            duration_from_tokens(self.config.rate, balance.unsigned_abs())
        } else {
            Duration::ZERO
        };

        let admissible = n <= self.config.burst && max_wait.map_or(true, |max| wait < max);

        match now.checked_add(wait) {
            Some(act_at) if admissible => {
                state.tokens = balance;
                state.last = now;
                state.last_event = act_at;

                trace!(n, balance, ?wait, "reservation granted");
                Reservation::granted(self, n, act_at)
            }
            _ => {
                trace!(n, ?wait, ?max_wait, "reservation rejected");
                Reservation::rejected(self, n, now)
            }
        }
    }

    /// Wait for a single token.
    ///
    /// See [`Limiter::wait_n`].
    pub async fn wait(&self, ctx: &Context) -> Result<()> {
        self.wait_n(ctx, 1).await
    }

    /// Wait until `n` tokens are available, or until `ctx` is done.
    ///
    /// Returns immediately if the tokens are available. Otherwise the tokens
    /// are reserved and the current task is suspended until they have
    /// accrued. Requests which cannot complete before the deadline of `ctx`
    /// are never granted, and wait for the deadline to fail.
    ///
    /// If `ctx` is cancelled or expires while waiting, or the returned future
    /// is dropped, the reserved tokens are refunded.
    ///
    /// # Errors
    ///
    /// * [`Error::BurstExceeded`] if `n` is larger than the burst.
    /// * [`Error::Cancelled`] or [`Error::DeadlineExceeded`] if `ctx` ends
    ///   before the tokens are available.
    ///
    /// # Examples
    ///
    /// ```
    /// use token_gate::{Context, Limiter};
    /// use tokio::time::{Duration, Instant};
    ///
    /// # #[tokio::main(flavor="current_thread", start_paused=true)] async fn main() -> token_gate::Result<()> {
    /// let limiter = Limiter::new(2, 2)?;
    /// let ctx = Context::with_timeout(Duration::from_secs(5));
    /// let start = Instant::now();
    ///
    /// limiter.wait_n(&ctx, 2).await?;
    /// limiter.wait_n(&ctx, 1).await?;
    ///
    /// assert_eq!(Instant::now() - start, Duration::from_millis(500));
    /// # Ok(()) }
    /// ```
    pub async fn wait_n(&self, ctx: &Context, n: u64) -> Result<()> {
        if n > self.config.burst {
            debug!(n, burst = self.config.burst, "request exceeds burst");
            return Err(Error::BurstExceeded {
                requested: n,
                burst: self.config.burst,
            });
        }

        let now = Instant::now();

        if let Some(error) = ctx.err_at(now) {
            return Err(error);
        }

        let reservation = self.reserve_n(now, n, ctx.remaining_at(now));
        let delay = reservation.delay_from(now);

        if delay.is_zero() {
            return Ok(());
        }

        let guard = RefundGuard::new(reservation);

        tokio::select! {
            biased;
            _ = time::sleep(delay) => {
                guard.consume();
                Ok(())
            }
            error = ctx.done() => {
                drop(guard);
                debug!(n, %error, "wait aborted");
                Err(error)
            }
        }
    }
}

/// A builder for a [`Limiter`].
#[derive(Debug, Clone)]
pub struct Builder {
    /// Tokens regained per second.
    rate: u64,
    /// The max number of tokens.
    burst: u64,
}

impl Builder {
    /// Configure how many tokens are regained per second. The default value
    /// is `1`.
    ///
    /// # Examples
    ///
    /// ```
    /// use token_gate::Limiter;
    ///
    /// let limiter = Limiter::builder()
    ///     .rate(100)
    ///     .build()?;
    ///
    /// assert_eq!(limiter.rate(), 100);
    /// # Ok::<_, token_gate::Error>(())
    /// ```
    pub fn rate(&mut self, rate: u64) -> &mut Self {
        self.rate = rate;
        self
    }

    /// Configure the max number of tokens, which is also the largest number
    /// of tokens a single request may ask for. The default value is `1`.
    ///
    /// The maximum supported burst is limited to [`i64::MAX`].
    ///
    /// # Examples
    ///
    /// ```
    /// use token_gate::Limiter;
    ///
    /// let limiter = Limiter::builder()
    ///     .burst(10_000)
    ///     .build()?;
    ///
    /// assert_eq!(limiter.burst(), 10_000);
    /// # Ok::<_, token_gate::Error>(())
    /// ```
    pub fn burst(&mut self, burst: u64) -> &mut Self {
        self.burst = burst;
        self
    }

    /// Construct a new [`Limiter`] with a full bucket.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::InvalidConfiguration`] if the rate or the burst
    /// is zero, or the burst exceeds [`i64::MAX`].
    pub fn build(&self) -> Result<Limiter> {
        let Self { rate, burst } = *self;

        if rate == 0 {
            return Err(Error::InvalidConfiguration("rate must be positive"));
        }

        if burst == 0 {
            return Err(Error::InvalidConfiguration("burst must be positive"));
        }

        if burst > MAX_BALANCE {
            return Err(Error::InvalidConfiguration(
                "burst exceeds the maximum supported balance",
            ));
        }

        let now = Instant::now();

        Ok(Limiter {
            config: LimiterConfig { rate, burst },
            state: Mutex::new(LimiterState {
                tokens: burst as i64,
                last: now,
                last_event: now,
            }),
        })
    }
}

/// Construct a new builder with default options.
///
/// # Examples
///
/// ```
/// use token_gate::Builder;
///
/// let limiter = Builder::default().build()?;
/// assert_eq!(limiter.rate(), 1);
/// assert_eq!(limiter.burst(), 1);
/// # Ok::<_, token_gate::Error>(())
/// ```
impl Default for Builder {
    fn default() -> Self {
        Self { rate: 1, burst: 1 }
    }
}
