//! Session cancellation.
//!
//! A [`CancelHandle`] is held by whoever may stop a session (the CLI's
//! Ctrl-C handler, a test). Workers hold [`CancelToken`]s and either poll
//! [`CancelToken::is_cancelled`] between units of work or await
//! [`CancelToken::cancelled`] alongside a fetch or subprocess.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelHandle {
  tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
  fn default() -> Self {
    Self::new()
  }
}

impl CancelHandle {
  pub fn new() -> Self {
    let (tx, _rx) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  /// Request cancellation. Idempotent.
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn token(&self) -> CancelToken {
    CancelToken { rx: self.tx.subscribe() }
  }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
  rx: watch::Receiver<bool>,
}

impl CancelToken {
  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once cancellation is requested. Never resolves if every
  /// handle is dropped without cancelling.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn token_observes_cancel() {
    let handle = CancelHandle::new();
    let token = handle.token();
    assert!(!token.is_cancelled());

    let waiter = tokio::spawn({
      let token = token.clone();
      async move { token.cancelled().await }
    });
    handle.cancel();

    tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    assert!(token.is_cancelled());
    assert!(handle.is_cancelled());
  }

  #[tokio::test]
  async fn token_taken_after_cancel_is_cancelled() {
    let handle = CancelHandle::new();
    handle.cancel();
    let token = handle.token();
    assert!(token.is_cancelled());
    tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await.unwrap();
  }

  #[tokio::test]
  async fn dropped_handle_never_cancels() {
    let token = CancelHandle::new().token();
    let waited = tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
    assert!(waited.is_err());
    assert!(!token.is_cancelled());
  }
}
