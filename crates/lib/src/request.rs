//! Request ownership, priority and cancellation.
//!
//! Every build job and cache batch runs on behalf of a [`RequestOwner`]. The
//! owner carries the priority handed to schedulers and a cooperative
//! cancellation flag: cancelling the owner flags every registered request and
//! asks it to finish as soon as possible.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::debug;

/// Final status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
  Ok,
  Error,
  Canceled,
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Status::Ok => write!(f, "ok"),
      Status::Error => write!(f, "error"),
      Status::Canceled => write!(f, "canceled"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
  Lowest,
  Low,
  #[default]
  Normal,
  High,
  Highest,
  /// The caller is blocked waiting on the result.
  Blocking,
}

/// A request that can be cancelled through its owner.
pub trait OwnedRequest: Send + Sync {
  fn cancel(&self);
}

struct OwnerInner {
  priority: Priority,
  canceled: AtomicBool,
  next_id: AtomicU64,
  requests: Mutex<HashMap<u64, Arc<dyn OwnedRequest>>>,
  active: watch::Sender<usize>,
}

/// Shared owner of a group of requests.
#[derive(Clone)]
pub struct RequestOwner {
  inner: Arc<OwnerInner>,
}

/// Registration handle returned by [`RequestOwner::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestOwner {
  pub fn new(priority: Priority) -> Self {
    let (active, _) = watch::channel(0);
    Self {
      inner: Arc::new(OwnerInner {
        priority,
        canceled: AtomicBool::new(false),
        next_id: AtomicU64::new(1),
        requests: Mutex::new(HashMap::new()),
        active,
      }),
    }
  }

  pub fn priority(&self) -> Priority {
    self.inner.priority
  }

  pub fn is_canceled(&self) -> bool {
    self.inner.canceled.load(Ordering::Acquire)
  }

  /// Track a request until [`end`](Self::end) is called for it.
  ///
  /// A request registered after the owner was cancelled is cancelled
  /// immediately.
  pub fn register(&self, request: Arc<dyn OwnedRequest>) -> RequestId {
    let id = RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
    {
      let mut requests = self.inner.requests.lock().unwrap_or_else(|e| e.into_inner());
      requests.insert(id.0, request.clone());
      self.inner.active.send_replace(requests.len());
    }
    if self.is_canceled() {
      request.cancel();
    }
    id
  }

  /// Stop tracking a finished request.
  pub fn end(&self, id: RequestId) {
    let mut requests = self.inner.requests.lock().unwrap_or_else(|e| e.into_inner());
    if requests.remove(&id.0).is_some() {
      self.inner.active.send_replace(requests.len());
    }
  }

  /// Number of registered requests that have not ended.
  pub fn active_requests(&self) -> usize {
    *self.inner.active.borrow()
  }

  /// Flag the owner as cancelled and cancel every registered request.
  pub fn cancel(&self) {
    if self.inner.canceled.swap(true, Ordering::AcqRel) {
      return;
    }
    let requests: Vec<Arc<dyn OwnedRequest>> = {
      let requests = self.inner.requests.lock().unwrap_or_else(|e| e.into_inner());
      requests.values().cloned().collect()
    };
    debug!(requests = requests.len(), "cancelling request owner");
    for request in requests {
      request.cancel();
    }
  }

  /// Wait until every registered request has ended.
  pub async fn wait(&self) {
    let mut active = self.inner.active.subscribe();
    // The sender lives as long as `self`, so this only fails if it was dropped.
    let _ = active.wait_for(|count| *count == 0).await;
  }
}

impl Default for RequestOwner {
  fn default() -> Self {
    Self::new(Priority::Normal)
  }
}

impl fmt::Debug for RequestOwner {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RequestOwner")
      .field("priority", &self.inner.priority)
      .field("canceled", &self.is_canceled())
      .field("active", &self.active_requests())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[derive(Default)]
  struct CountingRequest {
    cancels: AtomicUsize,
  }

  impl OwnedRequest for CountingRequest {
    fn cancel(&self) {
      self.cancels.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn cancel_reaches_registered_requests_once() {
    let owner = RequestOwner::default();
    let request = Arc::new(CountingRequest::default());
    owner.register(request.clone());

    owner.cancel();
    owner.cancel();

    assert!(owner.is_canceled());
    assert_eq!(request.cancels.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn register_after_cancel_cancels_immediately() {
    let owner = RequestOwner::default();
    owner.cancel();
    let request = Arc::new(CountingRequest::default());
    owner.register(request.clone());
    assert_eq!(request.cancels.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn ended_requests_are_not_cancelled() {
    let owner = RequestOwner::default();
    let request = Arc::new(CountingRequest::default());
    let id = owner.register(request.clone());
    owner.end(id);
    owner.cancel();
    assert_eq!(request.cancels.load(Ordering::SeqCst), 0);
    assert_eq!(owner.active_requests(), 0);
  }

  #[tokio::test]
  async fn wait_returns_when_all_requests_end() {
    let owner = RequestOwner::new(Priority::High);
    let id = owner.register(Arc::new(CountingRequest::default()));
    let waiter = {
      let owner = owner.clone();
      tokio::spawn(async move { owner.wait().await })
    };
    owner.end(id);
    waiter.await.unwrap();
    assert_eq!(owner.priority(), Priority::High);
  }
}
