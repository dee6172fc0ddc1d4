use core::future::Future;
use core::pin::Pin;
use core::task::Poll;
use core::time::Duration;

use pin_project_lite::pin_project;
use tokio::time::{self, Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::Error;

/// A cancellation scope with an optional deadline, bounding how long a call
/// to [`Limiter::wait_n`] is allowed to suspend.
///
/// Cloning a context shares its cancellation token, so cancelling any clone
/// cancels all of them.
///
/// # Examples
///
/// ```
/// use token_gate::{Context, Error};
/// use tokio::time::Duration;
///
/// # #[tokio::main(flavor="current_thread", start_paused=true)] async fn main() {
/// let ctx = Context::with_timeout(Duration::from_secs(2));
/// assert_eq!(ctx.err(), None);
///
/// ctx.cancel();
/// assert_eq!(ctx.err(), Some(Error::Cancelled));
/// # }
/// ```
///
/// [`Limiter::wait_n`]: crate::Limiter::wait_n
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context which is never done unless explicitly cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context which expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// A context which expires after `timeout` from now.
    ///
    /// A timeout too large to be represented never expires.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    /// A context driven by an existing cancellation token, without a deadline.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A child context which is cancelled along with this one, but whose
    /// cancellation does not propagate back to the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context expiring at `deadline` or at the parent's deadline,
    /// whichever comes first.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// The deadline of this context, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The cancellation token backing this context.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and every child derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The error this context ended with, or `None` if it is still live.
    pub fn err(&self) -> Option<Error> {
        self.err_at(Instant::now())
    }

    /// The error this context ended with as of `now`.
    ///
    /// Cancellation takes precedence over an expired deadline.
    pub fn err_at(&self, now: Instant) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Cancelled);
        }

        match self.deadline {
            Some(deadline) if deadline <= now => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Time left until the deadline as of `now`, `None` if there is none.
    pub(crate) fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// A future which resolves once this context is cancelled or its deadline
    /// passes, yielding the corresponding error.
    pub fn done(&self) -> Done<'_> {
        let deadline = match self.deadline {
            Some(at) => DeadlineState::At {
                sleep: time::sleep_until(at),
            },
            None => DeadlineState::Never,
        };

        Done {
            cancelled: self.token.cancelled(),
            deadline,
        }
    }
}

pin_project!(
    /// Future returned by [`Context::done`].
    pub struct Done<'a> {
        #[pin]
        cancelled: WaitForCancellationFuture<'a>,
        #[pin]
        deadline: DeadlineState,
    }
);

pin_project!(
    #[project = DeadlineStateProj]
    enum DeadlineState {
        Never,
        At {
            #[pin]
            sleep: Sleep,
        },
    }
);

impl Future for Done<'_> {
    type Output = Error;

    fn poll(self: Pin<&mut Self>, cx: &mut core::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if this.cancelled.poll(cx).is_ready() {
            return Poll::Ready(Error::Cancelled);
        }

        if let DeadlineStateProj::At { sleep } = this.deadline.project() {
            if sleep.poll(cx).is_ready() {
                return Poll::Ready(Error::DeadlineExceeded);
            }
        }

        Poll::Pending
    }
}
