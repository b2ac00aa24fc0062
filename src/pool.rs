use std::collections::HashMap;
use std::future::Future;

use bytes::Bytes;
use rand::Rng;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::connection::PutOptions;
use crate::errors::{Error, Result};
use crate::types::job::Job;

/// Stats keys naming the server rather than counting its work. Summing
/// them across a cluster would be nonsense, so their distinct values are
/// collected instead.
const IDENTITY_KEYS: &[&str] = &["name", "version", "pid"];

/// A set of independent per-server connections presented as one client.
///
/// Producer operations go to one member picked uniformly at random;
/// tube-session and stats operations broadcast to every member; `peek`
/// walks members in configured order and stops at the first hit.
///
/// A member that suffers a transport fault is dropped, its address is
/// redialled, and the operation retried; a fresh member starts from
/// protocol defaults, so callers must reapply `use`/`watch` state after a
/// reconnect. A `Draining` refusal is retried in place without
/// reconnecting - callers wanting bounded latency should wrap pool calls
/// in their own deadline.
pub struct Pool {
    addrs: Vec<String>,
    members: HashMap<String, Client>,
}

impl Pool {
    /// Builds a pool over the given addresses and opens what it can.
    /// Unreachable servers are logged and skipped: partial availability
    /// beats failing the whole pool.
    pub async fn connect<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut pool = Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
            members: HashMap::new(),
        };
        pool.reconnect().await;
        pool
    }

    /// Dials every configured address not currently in the pool.
    /// Idempotent. Returns how many members are open afterwards.
    pub async fn reconnect(&mut self) -> usize {
        for addr in self.addrs.clone() {
            if self.members.contains_key(&addr) {
                continue;
            }

            match Client::connect(&addr).await {
                Ok(client) => {
                    debug!(addr, "pool member connected");
                    self.members.insert(addr, client);
                },
                Err(error) => warn!(addr, %error, "pool member unreachable"),
            }
        }

        self.members.len()
    }

    /// How many members are currently open.
    pub fn open_count(&self) -> usize {
        self.members.len()
    }

    /// The configured addresses, connected or not.
    pub fn addrs(&self) -> &[String] {
        &self.addrs
    }

    /// Enqueues a job via one randomly chosen member.
    pub async fn put(
        &mut self,
        body: impl Into<Bytes>,
        opts: PutOptions,
    ) -> Result<u64> {
        let body = body.into();
        self.dispatch(move |c| {
            let body = body.clone();
            async move { c.put(body, opts).await }
        })
        .await
    }

    /// Serialises `value` through the codec and puts the result.
    pub async fn put_encoded<S: Serialize>(
        &mut self,
        value: &S,
        opts: PutOptions,
    ) -> Result<u64> {
        let body = serde_yaml::to_string(value)?;
        self.put(body.into_bytes(), opts).await
    }

    /// Blocks on one randomly chosen member until it yields a job.
    pub async fn reserve(&mut self) -> Result<Job> {
        self.dispatch(|c| async move { c.reserve().await }).await
    }

    /// As `reserve`, abandoning the wait when `cancel` fires.
    pub async fn reserve_with(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Job> {
        self.dispatch(move |c| {
            let cancel = cancel.clone();
            async move { c.reserve_with(&cancel).await }
        })
        .await
    }

    /// Walks members in configured order and returns the first ready job
    /// found; members after the hit are not contacted.
    pub async fn peek(&mut self) -> Result<Option<Job>> {
        for client in self.snapshot() {
            let found = self
                .attempt_entry(client, &|c: Client| async move {
                    c.peek().await
                })
                .await?;

            if let Some(Some(job)) = found {
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    /// Asks every member for the job, keyed by address. Servers that don't
    /// know the ID are left out of the result.
    pub async fn peek_job(&mut self, id: u64) -> Result<HashMap<String, Job>> {
        let per_server = self
            .broadcast(move |c| async move { c.peek_job(id).await })
            .await?;

        Ok(per_server
            .into_iter()
            .filter_map(|(addr, found)| found.map(|job| (addr, job)))
            .collect())
    }

    /// Selects the put tube on every member, keyed by address.
    pub async fn use_tube(
        &mut self,
        tube: &str,
    ) -> Result<HashMap<String, String>> {
        let tube = tube.to_owned();
        self.broadcast(move |c| {
            let tube = tube.clone();
            async move { c.use_tube(&tube).await }
        })
        .await
    }

    /// Watches the tube on every member; values are each member's watch
    /// count.
    pub async fn watch(&mut self, tube: &str) -> Result<HashMap<String, u32>> {
        let tube = tube.to_owned();
        self.broadcast(move |c| {
            let tube = tube.clone();
            async move { c.watch(&tube).await }
        })
        .await
    }

    /// Ignores the tube on every member.
    pub async fn ignore(&mut self, tube: &str) -> Result<HashMap<String, u32>> {
        let tube = tube.to_owned();
        self.broadcast(move |c| {
            let tube = tube.clone();
            async move { c.ignore(&tube).await }
        })
        .await
    }

    /// Per-server statistics, keyed by address, unmerged.
    pub async fn raw_stats(&mut self) -> Result<HashMap<String, Mapping>> {
        self.broadcast(|c| async move { c.stats().await }).await
    }

    /// Cluster-wide statistics: per-server documents merged key by key, in
    /// configured-address order.
    pub async fn stats(&mut self) -> Result<Mapping> {
        let raw = self.raw_stats().await?;
        Ok(merge_stats(self.ordered_docs(raw)))
    }

    /// Cluster-wide statistics for one tube.
    pub async fn tube_stats(&mut self, tube: &str) -> Result<Mapping> {
        let tube = tube.to_owned();
        let per_server = self
            .broadcast(move |c| {
                let tube = tube.clone();
                async move { c.tube_stats(&tube).await }
            })
            .await?;

        Ok(merge_stats(self.ordered_docs(per_server)))
    }

    /// Reorders a broadcast result into configured-address order, so
    /// collected sequences in a merge come out in a stable order.
    fn ordered_docs(
        &self,
        mut per_server: HashMap<String, Mapping>,
    ) -> Vec<Mapping> {
        self.addrs
            .iter()
            .filter_map(|addr| per_server.remove(addr))
            .collect()
    }

    /// Tube listings per member, keyed by address.
    pub async fn list_tubes(
        &mut self,
    ) -> Result<HashMap<String, Vec<String>>> {
        self.broadcast(|c| async move { c.list_tubes().await }).await
    }

    /// The used tube per member, keyed by address.
    pub async fn list_tube_used(
        &mut self,
    ) -> Result<HashMap<String, String>> {
        self.broadcast(|c| async move { c.list_tube_used().await })
            .await
    }

    /// The watch list per member, keyed by address.
    pub async fn list_tubes_watched(
        &mut self,
        cached: bool,
    ) -> Result<HashMap<String, Vec<String>>> {
        self.broadcast(move |c| async move {
            c.list_tubes_watched(cached).await
        })
        .await
    }

    /// Members in configured-address order. Broadcasts work off this
    /// snapshot so one entry's reconnect can't change which siblings get
    /// dispatched to.
    fn snapshot(&self) -> Vec<Client> {
        self.addrs
            .iter()
            .filter_map(|addr| self.members.get(addr))
            .cloned()
            .collect()
    }

    fn pick(&self) -> Result<Client> {
        if self.members.is_empty() {
            return Err(Error::NotConnected);
        }

        let n = rand::thread_rng().gen_range(0..self.members.len());
        self.members
            .values()
            .nth(n)
            .cloned()
            .ok_or(Error::NotConnected)
    }

    fn remove(&mut self, addr: &str) {
        if self.members.remove(addr).is_some() {
            warn!(addr, "dropping failed pool member");
        }
    }

    /// Random dispatch with the recovery policy. Reselects a member after
    /// each transport fault; fails with `NotConnected` once no member is
    /// left and the addresses can't be redialled.
    async fn dispatch<R, F, Fut>(&mut self, op: F) -> Result<R>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        loop {
            let client = self.pick()?;

            if let Some(res) = self.attempt(&client, &op).await {
                return res;
            }
        }
    }

    /// Runs `op` against one member under the recovery policy: a draining
    /// refusal is retried in place, a transport fault drops the member and
    /// redials (returning `None` so the caller reselects), anything else
    /// is final.
    async fn attempt<R, F, Fut>(
        &mut self,
        client: &Client,
        op: &F,
    ) -> Option<Result<R>>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        loop {
            match op(client.clone()).await {
                Err(Error::Draining) => {
                    debug!(addr = client.addr(), "server draining, retrying");
                },
                Err(Error::ReserveCancelled) => {
                    // Caller-initiated: heal the pool but don't retry.
                    self.remove(client.addr());
                    self.reconnect().await;
                    return Some(Err(Error::ReserveCancelled));
                },
                Err(e) if e.is_transport_fault() => {
                    debug!(addr = client.addr(), error = %e, "member failed");
                    self.remove(client.addr());
                    self.reconnect().await;
                    return None;
                },
                other => return Some(other),
            }
        }
    }

    /// Broadcast-entry recovery: as `attempt`, but a dropped member is
    /// retried on its own redialled address, and the entry is skipped
    /// (`Ok(None)`) if that address couldn't be reopened.
    async fn attempt_entry<R, F, Fut>(
        &mut self,
        mut client: Client,
        op: &F,
    ) -> Result<Option<R>>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        loop {
            match self.attempt(&client, op).await {
                Some(Ok(r)) => return Ok(Some(r)),
                Some(Err(e)) => return Err(e),
                None => {
                    let addr = client.addr().to_owned();
                    match self.members.get(&addr) {
                        Some(fresh) => client = fresh.clone(),
                        None => return Ok(None),
                    }
                },
            }
        }
    }

    /// Runs `op` on every member in the snapshot, collecting results by
    /// address. Entries whose member is lost and can't be reopened are
    /// omitted; non-recoverable errors abort the broadcast.
    async fn broadcast<R, F, Fut>(
        &mut self,
        op: F,
    ) -> Result<HashMap<String, R>>
    where
        F: Fn(Client) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut results = HashMap::new();

        for client in self.snapshot() {
            let addr = client.addr().to_owned();

            if let Some(r) = self.attempt_entry(client, &op).await? {
                results.insert(addr, r);
            }
        }

        Ok(results)
    }
}

/// Outer-join merge of per-server stats documents, keyed by field name.
/// Identity keys collect the distinct values seen; any other key adds
/// numerically. Keys present in a single document pass through unchanged.
fn merge_stats(docs: impl IntoIterator<Item = Mapping>) -> Mapping {
    let mut merged: Vec<(Value, Value)> = Vec::new();

    for doc in docs {
        for (key, value) in doc {
            let identity = is_identity(&key);

            match merged.iter().position(|(k, _)| *k == key) {
                Some(i) => combine(&mut merged[i].1, value, identity),
                None => {
                    let initial = if identity {
                        Value::Sequence(vec![value])
                    } else {
                        value
                    };
                    merged.push((key, initial));
                },
            }
        }
    }

    merged.into_iter().collect()
}

fn is_identity(key: &Value) -> bool {
    key.as_str().is_some_and(|k| IDENTITY_KEYS.contains(&k))
}

fn combine(slot: &mut Value, value: Value, identity: bool) {
    if identity {
        if let Value::Sequence(seen) = slot {
            if !seen.contains(&value) {
                seen.push(value);
            }
        }
        return;
    }

    *slot = add_values(slot, &value);
}

/// Numeric addition where both sides are numbers; anything else falls back
/// to collecting the distinct values, as for identity keys.
fn add_values(a: &Value, b: &Value) -> Value {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return Value::from(x.saturating_add(y));
    }

    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return Value::from(x + y);
    }

    if a == b {
        return a.clone();
    }

    // An earlier disagreement on this key already collected a sequence:
    // extend it rather than nesting sequences inside each other.
    if let Value::Sequence(seen) = a {
        let mut seen = seen.clone();
        if !seen.contains(b) {
            seen.push(b.clone());
        }
        return Value::Sequence(seen);
    }

    Value::Sequence(vec![a.clone(), b.clone()])
}
