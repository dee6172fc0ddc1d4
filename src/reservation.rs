use core::fmt;
use core::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{tokens_from_duration, Limiter};

/// The outcome of a single admission attempt against a [`Limiter`].
///
/// A granted reservation holds `tokens` from the limiter from the moment it is
/// created. The caller may act once [`act_at`] has passed, or give up early
/// through [`cancel`], which returns whatever part of the reservation has not
/// since been claimed by later reservations.
///
/// # Examples
///
/// ```
/// use token_gate::Limiter;
/// use tokio::time::{Duration, Instant};
///
/// # #[tokio::main(flavor="current_thread", start_paused=true)] async fn main() -> token_gate::Result<()> {
/// let limiter = Limiter::new(1, 2)?;
/// let now = Instant::now();
///
/// let first = limiter.reserve_n(now, 2, None);
/// assert_eq!(first.delay_from(now), Duration::ZERO);
///
/// let second = limiter.reserve_n(now, 1, None);
/// assert_eq!(second.delay_from(now), Duration::from_secs(1));
///
/// second.cancel_at(now);
/// assert_eq!(limiter.balance_at(now), 0);
/// # Ok(()) }
/// ```
///
/// [`act_at`]: Reservation::act_at
/// [`cancel`]: Reservation::cancel
pub struct Reservation<'a> {
    limiter: &'a Limiter,
    granted: bool,
    tokens: u64,
    rate: u64,
    act_at: Instant,
}

impl<'a> Reservation<'a> {
    pub(crate) fn granted(limiter: &'a Limiter, tokens: u64, act_at: Instant) -> Self {
        Self {
            limiter,
            granted: true,
            tokens,
            rate: limiter.rate(),
            act_at,
        }
    }

    pub(crate) fn rejected(limiter: &'a Limiter, tokens: u64, now: Instant) -> Self {
        Self {
            limiter,
            granted: false,
            tokens,
            rate: limiter.rate(),
            act_at: now,
        }
    }

    /// Test if the limiter admitted this reservation.
    pub fn is_granted(&self) -> bool {
        self.granted
    }

    /// The number of tokens requested.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// The instant at which the caller may act, `None` if not granted.
    pub fn act_at(&self) -> Option<Instant> {
        self.granted.then_some(self.act_at)
    }

    /// How long the caller has to wait from now before acting.
    pub fn delay(&self) -> Duration {
        self.delay_from(Instant::now())
    }

    /// How long the caller has to wait from `now` before acting.
    ///
    /// A reservation which was not granted can never be acted upon, and
    /// reports [`Duration::MAX`].
    pub fn delay_from(&self, now: Instant) -> Duration {
        if !self.granted {
            return Duration::MAX;
        }

        self.act_at.saturating_duration_since(now)
    }

    /// Cancel the reservation, refunding unclaimed tokens to the limiter.
    pub fn cancel(self) {
        self.cancel_at(Instant::now());
    }

    /// Cancel the reservation as of `now`.
    ///
    /// Tokens which reservations granted after this one have already been
    /// promised are not refunded. Does nothing if the reservation was not
    /// granted.
    pub fn cancel_at(self, now: Instant) {
        if !self.granted {
            return;
        }

        let limiter = self.limiter;
        let mut state = limiter.state.lock();

        let claimed = tokens_from_duration(
            self.rate,
            state.last_event.saturating_duration_since(self.act_at),
        );
        let requested = i64::try_from(self.tokens).unwrap_or(i64::MAX);
        let refund = requested.saturating_sub(claimed);

        if refund <= 0 {
            trace!(tokens = self.tokens, claimed, "nothing to refund");
            return;
        }

        let (balance, last) = state.advance(&limiter.config, now);
        state.tokens = balance
            .saturating_add(refund)
            .min(limiter.config.max_balance());
        state.last = last;

        debug!(
            tokens = self.tokens,
            refund,
            balance = state.tokens,
            "refunded cancelled reservation"
        );
    }
}

impl fmt::Debug for Reservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("granted", &self.granted)
            .field("tokens", &self.tokens)
            .field("rate", &self.rate)
            .field("act_at", &self.act_at)
            .finish_non_exhaustive()
    }
}

/// Refunds the held reservation unless it is consumed first.
///
/// Keeps a dropped wait future from leaking its tokens.
pub(crate) struct RefundGuard<'a> {
    reservation: Option<Reservation<'a>>,
}

impl<'a> RefundGuard<'a> {
    pub(crate) fn new(reservation: Reservation<'a>) -> Self {
        Self {
            reservation: Some(reservation),
        }
    }

    /// The caller acted on the reservation, nothing to refund.
    pub(crate) fn consume(mut self) {
        self.reservation = None;
    }
}

impl Drop for RefundGuard<'_> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            reservation.cancel();
        }
    }
}
