//! Cancellation composition with first-cause attribution.
//!
//! Every task of a batch runs under one effective [`TaskToken`], composed from
//! up to three independently owned sources:
//!
//! - the caller's token, cancelling the whole batch from outside,
//! - a per-task deadline, owned by that task alone,
//! - the batch's fail-fast token, owned by the dispatcher.
//!
//! [`compose`] fans these sources into a fresh composite. The composite fires
//! on the first constituent that fires and records which one it was. Recording
//! the cause is a single compare-and-swap from "none", so near-simultaneous
//! firings can neither double-fire the composite nor overwrite the cause.
//!
//! `tokio_util`'s [`CancellationToken`] only models a single parent per child,
//! so "fire when any source fires" is realized with an explicit listener task
//! rather than with child tokens.

use core::{fmt, future::Future, pin::Pin, time::Duration};
use futures::future::select_all;
use portable_atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Which source caused a [`TaskToken`] to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelCause {
    /// The caller cancelled the whole batch.
    Caller,
    /// The task exceeded its per-task timeout.
    Timeout,
    /// Another task of the batch failed while fail-fast was enabled.
    FailFast,
}

const NO_CAUSE: u8 = 0;

impl CancelCause {
    const fn to_raw(self) -> u8 {
        match self {
            Self::Caller => 1,
            Self::Timeout => 2,
            Self::FailFast => 3,
        }
    }

    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Caller),
            2 => Some(Self::Timeout),
            3 => Some(Self::FailFast),
            _ => None,
        }
    }
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Caller => write!(f, "caller"),
            Self::Timeout => write!(f, "timeout"),
            Self::FailFast => write!(f, "fail-fast"),
        }
    }
}

/// One constituent of a composed [`TaskToken`].
#[derive(Debug, Clone)]
pub enum CancelSource {
    /// An externally owned token, attributed to `cause` when it fires.
    Token {
        token: CancellationToken,
        cause: CancelCause,
    },
    /// A deadline measured from the moment the source is composed. Always
    /// attributed to [`CancelCause::Timeout`].
    Deadline(Duration),
}

impl CancelSource {
    /// A caller-owned token cancelling the whole batch.
    pub fn caller(token: CancellationToken) -> Self {
        Self::Token {
            token,
            cause: CancelCause::Caller,
        }
    }

    /// The dispatcher-owned fail-fast token of a batch.
    pub fn fail_fast(token: CancellationToken) -> Self {
        Self::Token {
            token,
            cause: CancelCause::FailFast,
        }
    }

    /// A per-task timeout.
    pub fn timeout(duration: Duration) -> Self {
        Self::Deadline(duration)
    }

    /// The cause recorded when this source fires.
    pub fn cause(&self) -> CancelCause {
        match self {
            Self::Token { cause, .. } => *cause,
            Self::Deadline(_) => CancelCause::Timeout,
        }
    }

    fn has_fired(&self) -> bool {
        match self {
            Self::Token { token, .. } => token.is_cancelled(),
            Self::Deadline(duration) => duration.is_zero(),
        }
    }

    fn into_fired(self) -> Pin<Box<dyn Future<Output = CancelCause> + Send>> {
        match self {
            Self::Token { token, cause } => Box::pin(async move {
                token.cancelled_owned().await;
                cause
            }),
            Self::Deadline(duration) => {
                let deadline = tokio::time::Instant::now() + duration;
                Box::pin(async move {
                    tokio::time::sleep_until(deadline).await;
                    CancelCause::Timeout
                })
            }
        }
    }
}

/// The effective cancellation token handed to an executor.
///
/// A [`TaskToken`] fires at most once and is immutable afterwards: once
/// [`is_cancelled`] returns `true`, [`cause`] returns the source that fired
/// first and never changes. Cloning is cheap; all clones observe the same
/// state.
///
/// Executors cannot fire a [`TaskToken`] themselves. To hand cancellation to a
/// library that expects a plain [`CancellationToken`], use [`child_token`].
///
/// [`is_cancelled`]: TaskToken::is_cancelled
/// [`cause`]: TaskToken::cause
/// [`child_token`]: TaskToken::child_token
#[derive(Debug, Clone)]
pub struct TaskToken {
    inner: Arc<TokenState>,
}

#[derive(Debug)]
struct TokenState {
    token: CancellationToken,
    cause: AtomicU8,
}

impl TaskToken {
    fn new() -> Self {
        Self {
            inner: Arc::new(TokenState {
                token: CancellationToken::new(),
                cause: AtomicU8::new(NO_CAUSE),
            }),
        }
    }

    /// A token with no sources. It never fires.
    pub fn never() -> Self {
        Self::new()
    }

    /// Returns `true` once any source of this token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The source that fired first, or `None` while the token is live.
    pub fn cause(&self) -> Option<CancelCause> {
        CancelCause::from_raw(self.inner.cause.load(Ordering::Acquire))
    }

    /// Waits until the token fires and resolves to the recorded cause.
    pub async fn cancelled(&self) -> CancelCause {
        self.inner.token.cancelled().await;
        // `fire` stores the cause before cancelling the inner token, so a
        // woken waiter always finds it.
        self.cause().unwrap_or(CancelCause::Caller)
    }

    /// A plain [`CancellationToken`] that is cancelled when this token fires.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Fires the token with `cause` if it has not fired yet.
    ///
    /// Returns `true` only for the call that actually fired it.
    pub(crate) fn fire(&self, cause: CancelCause) -> bool {
        let won = self
            .inner
            .cause
            .compare_exchange(NO_CAUSE, cause.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.inner.token.cancel();
        }
        won
    }
}

impl Default for TaskToken {
    fn default() -> Self {
        Self::never()
    }
}

/// A composed [`TaskToken`] together with the listener wiring its sources.
///
/// Dropping a [`ComposedToken`] detaches the composite from its sources: the
/// listener and any pending deadline are released without firing. Clones of
/// the [`TaskToken`] taken earlier keep their state but will not fire
/// afterwards.
#[derive(Debug)]
pub struct ComposedToken {
    token: TaskToken,
    _release: Option<DropGuard>,
}

impl ComposedToken {
    /// The composite token.
    pub fn token(&self) -> &TaskToken {
        &self.token
    }
}

/// Composes cancellation sources into one [`TaskToken`].
///
/// - No sources: the result never fires.
/// - A source that already fired at compose time fires the composite
///   immediately. When several did, the first in argument order wins.
/// - Otherwise a listener task waits on every source and fires the composite
///   with the cause of whichever source fires first.
///
/// # Panics
///
/// Spawns the listener on the current Tokio runtime, so this panics when
/// called outside of one with at least one pending source.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
/// use volley::{CancelCause, CancelSource, compose};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let caller = CancellationToken::new();
/// let composed = compose([
///     CancelSource::caller(caller.clone()),
///     CancelSource::timeout(Duration::from_secs(30)),
/// ]);
///
/// caller.cancel();
/// assert_eq!(composed.token().cancelled().await, CancelCause::Caller);
/// # }
/// ```
pub fn compose<S>(sources: S) -> ComposedToken
where
    S: IntoIterator<Item = CancelSource>,
{
    let token = TaskToken::new();
    let sources: Vec<CancelSource> = sources.into_iter().collect();

    if sources.is_empty() {
        return ComposedToken {
            token,
            _release: None,
        };
    }

    if let Some(fired) = sources.iter().find(|source| source.has_fired()) {
        token.fire(fired.cause());
        return ComposedToken {
            token,
            _release: None,
        };
    }

    let release = CancellationToken::new();
    let released = release.clone();
    let listener = token.clone();
    let first_fired = select_all(sources.into_iter().map(CancelSource::into_fired));

    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = released.cancelled() => {}
            (cause, _, _) = first_fired => {
                listener.fire(cause);
            }
        }
    });

    ComposedToken {
        token,
        _release: Some(release.drop_guard()),
    }
}
