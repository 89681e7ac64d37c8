use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`Deadline`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Timeout,
    Cancelled,
}

/// Per-job time limit plus a cancellation token.
///
/// Every blocking git or agent call selects against [`Deadline::expired`].
#[derive(Debug, Clone)]
pub struct Deadline {
    token: CancellationToken,
    expires_at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            expires_at: Instant::now() + timeout,
        }
    }

    /// A deadline that is also cancelled when `parent` is.
    pub fn with_parent(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            token: parent.child_token(),
            expires_at: Instant::now() + timeout,
        }
    }

    /// A tighter deadline sharing this one's cancellation. The earlier of the
    /// two expiry instants wins.
    pub fn narrowed(&self, timeout: Option<Duration>) -> Self {
        let expires_at = match timeout {
            Some(t) => self.expires_at.min(Instant::now() + t),
            None => self.expires_at,
        };
        Self {
            token: self.token.child_token(),
            expires_at,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves when the deadline passes or the token is cancelled.
    pub async fn expired(&self) -> Expiry {
        tokio::select! {
            _ = self.token.cancelled() => Expiry::Cancelled,
            _ = tokio::time::sleep_until(self.expires_at) => Expiry::Timeout,
        }
    }

    /// Non-blocking check, used between pipeline steps.
    pub fn check(&self) -> Option<Expiry> {
        if self.token.is_cancelled() {
            Some(Expiry::Cancelled)
        } else if Instant::now() >= self.expires_at {
            Some(Expiry::Timeout)
        } else {
            None
        }
    }
}
