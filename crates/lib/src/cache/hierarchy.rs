//! Ordered chain of cache stores.
//!
//! Nodes are visited in insertion order, so faster stores go first. Each node
//! carries [`CacheStoreFlags`] and two flag sets derived from its neighbours:
//! the store policy that some earlier node can satisfy, and the query policy
//! that some later node can satisfy. Both are recomputed whenever the node
//! list changes.
//!
//! A hit on a later node is copied back into the earlier nodes that can store
//! it. The copy runs in the background on the current tokio runtime and never
//! delays the caller. A node flagged `STOP_STORE` ends propagation: a hit there
//! is not copied, and a record stored there is not written to later nodes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::policy::{CachePolicy, CacheRecordPolicy, CacheStoreFlags};
use super::record::CacheRecord;
use super::store::{
  CacheGetChunkRequest, CacheGetChunkResponse, CacheGetRequest, CacheGetResponse, CacheGetValueRequest,
  CacheGetValueResponse, CachePutRequest, CachePutResponse, CachePutValueRequest, CachePutValueResponse, CacheStore,
  OnComplete,
};
use crate::request::{Priority, RequestOwner, Status};

#[derive(Debug, Default)]
struct NodeCounters {
  hits: AtomicU64,
  misses: AtomicU64,
  puts: AtomicU64,
  put_failures: AtomicU64,
  write_backs: AtomicU64,
}

/// Snapshot of one node's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNodeStats {
  pub name: String,
  pub flags: CacheStoreFlags,
  pub hits: u64,
  pub misses: u64,
  pub puts: u64,
  pub put_failures: u64,
  pub write_backs: u64,
}

struct Node {
  name: String,
  store: Arc<dyn CacheStore>,
  flags: CacheStoreFlags,
  /// Store policy that some earlier node can satisfy.
  prior_store: CachePolicy,
  /// Query policy that some later node can satisfy.
  later_query: CachePolicy,
  counters: Arc<NodeCounters>,
}

impl Node {
  fn query_policy(&self) -> CachePolicy {
    self.flags.query_policy()
  }

  fn store_policy(&self) -> CachePolicy {
    self.flags.store_policy()
  }

  fn stops_store(&self) -> bool {
    self.flags.contains(CacheStoreFlags::STOP_STORE)
  }
}

/// A write-back destination captured while the node list is read-locked.
#[derive(Clone)]
struct Target {
  name: String,
  store: Arc<dyn CacheStore>,
  counters: Arc<NodeCounters>,
}

/// Per-request bookkeeping while walking the node list.
struct Walk<R> {
  request: R,
  done: bool,
  passed_stop_store: bool,
}

impl<R> Walk<R> {
  fn new(request: R) -> Self {
    Self {
      request,
      done: false,
      passed_stop_store: false,
    }
  }
}

#[derive(Default)]
pub struct CacheStoreHierarchy {
  nodes: RwLock<Vec<Node>>,
  background: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheStoreHierarchy {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a store after every existing node.
  pub async fn add(&self, name: impl Into<String>, store: Arc<dyn CacheStore>, flags: CacheStoreFlags) {
    let name = name.into();
    debug!(node = %name, ?flags, "adding cache store");
    let mut nodes = self.nodes.write().await;
    nodes.push(Node {
      name,
      store,
      flags,
      prior_store: CachePolicy::NONE,
      later_query: CachePolicy::NONE,
      counters: Arc::default(),
    });
    recompute(&mut nodes);
  }

  /// Replace the flags of the node called `name`. Returns false if absent.
  pub async fn set_flags(&self, name: &str, flags: CacheStoreFlags) -> bool {
    let mut nodes = self.nodes.write().await;
    let Some(node) = nodes.iter_mut().find(|n| n.name == name) else {
      return false;
    };
    debug!(node = %name, ?flags, "updating cache store flags");
    node.flags = flags;
    recompute(&mut nodes);
    true
  }

  /// Remove the node called `name`. Returns false if absent.
  pub async fn remove(&self, name: &str) -> bool {
    let mut nodes = self.nodes.write().await;
    let before = nodes.len();
    nodes.retain(|n| n.name != name);
    let removed = nodes.len() != before;
    if removed {
      debug!(node = %name, "removed cache store");
      recompute(&mut nodes);
    }
    removed
  }

  pub async fn len(&self) -> usize {
    self.nodes.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.nodes.read().await.is_empty()
  }

  pub async fn stats(&self) -> Vec<CacheNodeStats> {
    self
      .nodes
      .read()
      .await
      .iter()
      .map(|node| CacheNodeStats {
        name: node.name.clone(),
        flags: node.flags,
        hits: node.counters.hits.load(Ordering::Relaxed),
        misses: node.counters.misses.load(Ordering::Relaxed),
        puts: node.counters.puts.load(Ordering::Relaxed),
        put_failures: node.counters.put_failures.load(Ordering::Relaxed),
        write_backs: node.counters.write_backs.load(Ordering::Relaxed),
      })
      .collect()
  }

  /// Wait for every background write-back started so far.
  pub async fn flush(&self) {
    loop {
      let pending: Vec<JoinHandle<()>> = {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *background)
      };
      if pending.is_empty() {
        return;
      }
      for handle in pending {
        if let Err(e) = handle.await {
          warn!(error = %e, "cache write-back task failed");
        }
      }
    }
  }

  /// Run `task` in the background when a runtime is available, inline otherwise.
  async fn run_write_back<F>(&self, task: F)
  where
    F: std::future::Future<Output = ()> + Send + 'static,
  {
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let join = handle.spawn(task);
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.retain(|h| !h.is_finished());
        background.push(join);
      }
      Err(_) => task.await,
    }
  }
}

fn recompute(nodes: &mut [Node]) {
  let mut prior = CachePolicy::NONE;
  for node in nodes.iter_mut() {
    node.prior_store = prior;
    prior |= node.store_policy();
  }
  let mut later = CachePolicy::NONE;
  for node in nodes.iter_mut().rev() {
    node.later_query = later;
    later |= node.query_policy();
  }
}

/// Earlier nodes that should receive a copy of a hit at `nodes[hit]`.
fn write_back_targets(nodes: &[Node], hit: usize, policy: CachePolicy, passed_stop_store: bool) -> Vec<Target> {
  let source = &nodes[hit];
  if passed_stop_store || source.stops_store() || !policy.intersects(source.prior_store) {
    return Vec::new();
  }
  let skip_local = policy.contains(CachePolicy::SKIP_LOCAL_COPY) && source.flags.contains(CacheStoreFlags::REMOTE);
  nodes[..hit]
    .iter()
    .filter(|node| policy.intersects(node.store_policy()))
    .filter(|node| !(skip_local && node.flags.contains(CacheStoreFlags::LOCAL)))
    .map(|node| Target {
      name: node.name.clone(),
      store: node.store.clone(),
      counters: node.counters.clone(),
    })
    .collect()
}

/// The open walk a backend response refers to. Responses with an unknown
/// `user_data`, or for a request that was already answered, are dropped.
fn open_walk<'a, R>(walks: &'a mut [Walk<R>], node: &str, user_data: u64) -> Option<(usize, &'a mut Walk<R>)> {
  let index = usize::try_from(user_data).ok()?;
  match walks.get_mut(index) {
    Some(walk) if !walk.done => Some((index, walk)),
    Some(_) => {
      warn!(node = %node, user_data, "ignoring repeated response for an answered request");
      None
    }
    None => {
      warn!(node = %node, user_data, "ignoring response for an unknown request");
      None
    }
  }
}

fn final_status(owner: &RequestOwner) -> Status {
  if owner.is_canceled() { Status::Canceled } else { Status::Error }
}

async fn write_back_record(targets: Vec<Target>, name: String, record: CacheRecord) {
  let owner = RequestOwner::new(Priority::Low);
  for target in targets {
    let request = CachePutRequest {
      name: name.clone(),
      record: record.clone(),
      policy: CacheRecordPolicy::new(CachePolicy::STORE),
      user_data: 0,
    };
    let mut status = Status::Error;
    target.store.put(vec![request], &owner, &mut |r| status = r.status).await;
    if status == Status::Ok {
      target.counters.write_backs.fetch_add(1, Ordering::Relaxed);
      trace!(node = %target.name, key = %record.key(), "wrote back cache record");
    } else {
      warn!(node = %target.name, key = %record.key(), %status, "cache write-back failed");
    }
  }
}

async fn write_back_value(targets: Vec<Target>, request: CachePutValueRequest) {
  let owner = RequestOwner::new(Priority::Low);
  for target in targets {
    let mut status = Status::Error;
    target.store.put_value(vec![request.clone()], &owner, &mut |r| status = r.status).await;
    if status == Status::Ok {
      target.counters.write_backs.fetch_add(1, Ordering::Relaxed);
      trace!(node = %target.name, key = %request.key, "wrote back cache value");
    } else {
      warn!(node = %target.name, key = %request.key, %status, "cache value write-back failed");
    }
  }
}

#[async_trait]
impl CacheStore for CacheStoreHierarchy {
  async fn put(&self, requests: Vec<CachePutRequest>, owner: &RequestOwner, on_complete: OnComplete<'_, CachePutResponse>) {
    let nodes = self.nodes.read().await;
    let mut walks: Vec<Walk<CachePutRequest>> = requests.into_iter().map(Walk::new).collect();
    let mut stored = vec![false; walks.len()];

    // Read-only stop-store nodes are authoritative: an existing copy there
    // satisfies the put.
    for node in nodes.iter().filter(|n| n.stops_store() && n.store_policy().is_empty()) {
      let mut batch = Vec::new();
      for (index, walk) in walks.iter().enumerate() {
        let query = walk.request.policy.record_policy() & node.query_policy();
        if !walk.done && !query.is_empty() {
          batch.push(CacheGetRequest {
            name: walk.request.name.clone(),
            key: walk.request.record.key().clone(),
            policy: CacheRecordPolicy::new(query | CachePolicy::SKIP_META | CachePolicy::SKIP_DATA),
            user_data: index as u64,
          });
        }
      }
      if batch.is_empty() || owner.is_canceled() {
        continue;
      }
      let mut hits = Vec::new();
      node
        .store
        .get(batch, owner, &mut |r| {
          if r.status == Status::Ok {
            hits.push(r.user_data);
          }
        })
        .await;
      for user_data in hits {
        let Some((_, walk)) = open_walk(&mut walks, &node.name, user_data) else {
          continue;
        };
        trace!(node = %node.name, key = %walk.request.record.key(), "put satisfied by existing record");
        node.counters.hits.fetch_add(1, Ordering::Relaxed);
        walk.done = true;
        on_complete(walk.request.respond(Status::Ok));
      }
    }

    for node in nodes.iter() {
      let store_policy = node.store_policy();
      if store_policy.is_empty() {
        continue;
      }
      let mut batch = Vec::new();
      for (index, walk) in walks.iter().enumerate() {
        if !walk.done && !walk.passed_stop_store && walk.request.policy.record_policy().intersects(store_policy) {
          let mut request = walk.request.clone();
          request.user_data = index as u64;
          batch.push(request);
        }
      }
      if batch.is_empty() || owner.is_canceled() {
        continue;
      }
      let mut responses = Vec::new();
      node.store.put(batch, owner, &mut |r| responses.push(r)).await;
      for response in responses {
        let Some((index, walk)) = open_walk(&mut walks, &node.name, response.user_data) else {
          continue;
        };
        if response.status == Status::Ok {
          node.counters.puts.fetch_add(1, Ordering::Relaxed);
          stored[index] = true;
          if node.stops_store() {
            walk.passed_stop_store = true;
          }
        } else {
          node.counters.put_failures.fetch_add(1, Ordering::Relaxed);
          debug!(node = %node.name, key = %response.key, status = %response.status, "cache put failed");
        }
      }
    }

    for (walk, stored) in walks.iter().zip(stored) {
      if !walk.done {
        let status = if stored { Status::Ok } else { final_status(owner) };
        on_complete(walk.request.respond(status));
      }
    }
  }

  async fn get(&self, requests: Vec<CacheGetRequest>, owner: &RequestOwner, on_complete: OnComplete<'_, CacheGetResponse>) {
    let nodes = self.nodes.read().await;
    let mut walks: Vec<Walk<CacheGetRequest>> = requests.into_iter().map(Walk::new).collect();

    for (node_index, node) in nodes.iter().enumerate() {
      if owner.is_canceled() {
        break;
      }
      let reachable = node.query_policy() | node.later_query;
      if walks
        .iter()
        .all(|w| w.done || !w.request.policy.record_policy().intersects(reachable))
      {
        break;
      }

      let mut batch = Vec::new();
      let mut targets = Vec::new();
      for (index, walk) in walks.iter().enumerate() {
        let policy = walk.request.policy.record_policy();
        if walk.done || !policy.intersects(node.query_policy()) {
          targets.push(Vec::new());
          continue;
        }
        let node_targets = write_back_targets(&nodes, node_index, policy, walk.passed_stop_store);
        let request_policy = if node_targets.is_empty() {
          walk.request.policy.clone()
        } else {
          walk.request.policy.transform(|p| p - CachePolicy::SKIP_FLAGS)
        };
        batch.push(CacheGetRequest {
          name: walk.request.name.clone(),
          key: walk.request.key.clone(),
          policy: request_policy,
          user_data: index as u64,
        });
        targets.push(node_targets);
      }

      if !batch.is_empty() {
        let mut responses = Vec::new();
        node.store.get(batch, owner, &mut |r| responses.push(r)).await;
        for response in responses {
          let Some((index, walk)) = open_walk(&mut walks, &node.name, response.user_data) else {
            continue;
          };
          if response.status != Status::Ok {
            node.counters.misses.fetch_add(1, Ordering::Relaxed);
            continue;
          }
          node.counters.hits.fetch_add(1, Ordering::Relaxed);
          walk.done = true;
          trace!(node = %node.name, key = %walk.request.key, "cache hit");

          let node_targets = std::mem::take(&mut targets[index]);
          if !node_targets.is_empty() && response.record.has_all_data() {
            let task = write_back_record(node_targets, walk.request.name.clone(), response.record.clone());
            self.run_write_back(task).await;
          }
          on_complete(CacheGetResponse {
            name: walk.request.name.clone(),
            record: response.record.apply_policy(&walk.request.policy),
            user_data: walk.request.user_data,
            status: Status::Ok,
          });
        }
      }

      if node.stops_store() {
        for walk in walks.iter_mut() {
          walk.passed_stop_store = true;
        }
      }
    }

    let status = final_status(owner);
    for walk in walks.iter().filter(|w| !w.done) {
      on_complete(walk.request.miss(status));
    }
  }

  async fn put_value(
    &self,
    requests: Vec<CachePutValueRequest>,
    owner: &RequestOwner,
    on_complete: OnComplete<'_, CachePutValueResponse>,
  ) {
    let nodes = self.nodes.read().await;
    let mut walks: Vec<Walk<CachePutValueRequest>> = requests.into_iter().map(Walk::new).collect();
    let mut stored = vec![false; walks.len()];

    for node in nodes.iter().filter(|n| n.stops_store() && n.store_policy().is_empty()) {
      let mut batch = Vec::new();
      for (index, walk) in walks.iter().enumerate() {
        let query = walk.request.policy & node.query_policy();
        if !walk.done && !query.is_empty() {
          batch.push(CacheGetValueRequest {
            name: walk.request.name.clone(),
            key: walk.request.key.clone(),
            policy: query | CachePolicy::SKIP_DATA,
            user_data: index as u64,
          });
        }
      }
      if batch.is_empty() || owner.is_canceled() {
        continue;
      }
      let mut hits = Vec::new();
      node
        .store
        .get_value(batch, owner, &mut |r| {
          if r.status == Status::Ok {
            hits.push(r.user_data);
          }
        })
        .await;
      for user_data in hits {
        let Some((_, walk)) = open_walk(&mut walks, &node.name, user_data) else {
          continue;
        };
        node.counters.hits.fetch_add(1, Ordering::Relaxed);
        walk.done = true;
        on_complete(walk.request.respond(Status::Ok));
      }
    }

    for node in nodes.iter() {
      let store_policy = node.store_policy();
      if store_policy.is_empty() {
        continue;
      }
      let mut batch = Vec::new();
      for (index, walk) in walks.iter().enumerate() {
        if !walk.done && !walk.passed_stop_store && walk.request.policy.intersects(store_policy) {
          let mut request = walk.request.clone();
          request.user_data = index as u64;
          batch.push(request);
        }
      }
      if batch.is_empty() || owner.is_canceled() {
        continue;
      }
      let mut responses = Vec::new();
      node.store.put_value(batch, owner, &mut |r| responses.push(r)).await;
      for response in responses {
        let Some((index, walk)) = open_walk(&mut walks, &node.name, response.user_data) else {
          continue;
        };
        if response.status == Status::Ok {
          node.counters.puts.fetch_add(1, Ordering::Relaxed);
          stored[index] = true;
          if node.stops_store() {
            walk.passed_stop_store = true;
          }
        } else {
          node.counters.put_failures.fetch_add(1, Ordering::Relaxed);
        }
      }
    }

    for (walk, stored) in walks.iter().zip(stored) {
      if !walk.done {
        let status = if stored { Status::Ok } else { final_status(owner) };
        on_complete(walk.request.respond(status));
      }
    }
  }

  async fn get_value(
    &self,
    requests: Vec<CacheGetValueRequest>,
    owner: &RequestOwner,
    on_complete: OnComplete<'_, CacheGetValueResponse>,
  ) {
    let nodes = self.nodes.read().await;
    let mut walks: Vec<Walk<CacheGetValueRequest>> = requests.into_iter().map(Walk::new).collect();

    for (node_index, node) in nodes.iter().enumerate() {
      if owner.is_canceled() {
        break;
      }
      let reachable = node.query_policy() | node.later_query;
      if walks.iter().all(|w| w.done || !w.request.policy.intersects(reachable)) {
        break;
      }

      let mut batch = Vec::new();
      let mut targets = Vec::new();
      for (index, walk) in walks.iter().enumerate() {
        let policy = walk.request.policy;
        if walk.done || !policy.intersects(node.query_policy()) {
          targets.push(Vec::new());
          continue;
        }
        let node_targets = write_back_targets(&nodes, node_index, policy, walk.passed_stop_store);
        let request_policy = if node_targets.is_empty() {
          policy
        } else {
          policy - CachePolicy::SKIP_FLAGS
        };
        batch.push(CacheGetValueRequest {
          name: walk.request.name.clone(),
          key: walk.request.key.clone(),
          policy: request_policy,
          user_data: index as u64,
        });
        targets.push(node_targets);
      }

      if !batch.is_empty() {
        let mut responses = Vec::new();
        node.store.get_value(batch, owner, &mut |r| responses.push(r)).await;
        for response in responses {
          let Some((index, walk)) = open_walk(&mut walks, &node.name, response.user_data) else {
            continue;
          };
          let Some(value) = response.value.filter(|_| response.status == Status::Ok) else {
            node.counters.misses.fetch_add(1, Ordering::Relaxed);
            continue;
          };
          node.counters.hits.fetch_add(1, Ordering::Relaxed);
          walk.done = true;

          let node_targets = std::mem::take(&mut targets[index]);
          if !node_targets.is_empty() && value.has_data() {
            let request = CachePutValueRequest {
              name: walk.request.name.clone(),
              key: walk.request.key.clone(),
              value: value.clone(),
              policy: CachePolicy::STORE,
              user_data: 0,
            };
            self.run_write_back(write_back_value(node_targets, request)).await;
          }
          let value = if walk.request.policy.contains(CachePolicy::SKIP_DATA) {
            value.without_data()
          } else {
            value
          };
          on_complete(CacheGetValueResponse {
            name: walk.request.name.clone(),
            key: walk.request.key.clone(),
            value: Some(value),
            user_data: walk.request.user_data,
            status: Status::Ok,
          });
        }
      }

      if node.stops_store() {
        for walk in walks.iter_mut() {
          walk.passed_stop_store = true;
        }
      }
    }

    let status = final_status(owner);
    for walk in walks.iter().filter(|w| !w.done) {
      on_complete(walk.request.miss(status));
    }
  }

  async fn get_chunks(
    &self,
    requests: Vec<CacheGetChunkRequest>,
    owner: &RequestOwner,
    on_complete: OnComplete<'_, CacheGetChunkResponse>,
  ) {
    let nodes = self.nodes.read().await;
    let mut walks: Vec<Walk<CacheGetChunkRequest>> = requests.into_iter().map(Walk::new).collect();

    for node in nodes.iter() {
      if owner.is_canceled() || walks.iter().all(|w| w.done) {
        break;
      }
      let mut batch = Vec::new();
      for (index, walk) in walks.iter().enumerate() {
        if !walk.done && walk.request.policy.intersects(node.query_policy()) {
          let mut request = walk.request.clone();
          request.user_data = index as u64;
          batch.push(request);
        }
      }
      if batch.is_empty() {
        continue;
      }
      let mut responses = Vec::new();
      node.store.get_chunks(batch, owner, &mut |r| responses.push(r)).await;
      for mut response in responses {
        let Some((_, walk)) = open_walk(&mut walks, &node.name, response.user_data) else {
          continue;
        };
        if response.status != Status::Ok {
          node.counters.misses.fetch_add(1, Ordering::Relaxed);
          continue;
        }
        node.counters.hits.fetch_add(1, Ordering::Relaxed);
        walk.done = true;
        response.user_data = walk.request.user_data;
        on_complete(response);
      }
    }

    let status = final_status(owner);
    for walk in walks.iter().filter(|w| !w.done) {
      on_complete(walk.request.miss(status));
    }
  }
}
