//! Bounded per-control snapshot cache (§4.4). Concurrent callers asking for
//! the same uncached revision share one in-flight computation rather than
//! each walking the log themselves.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::control::Snapshot;
use crate::delta::DeltaAlgebra;
use crate::error::{BayouError, ErrorKind};

const CACHE_CAP: usize = 16;

struct Inner<D> {
    entries: BTreeMap<u64, D>,
    /// Production order, oldest first; a revision can appear once, moved to
    /// the back whenever it's (re)produced.
    order: VecDeque<u64>,
    in_flight: HashMap<u64, Arc<OnceCell<D>>>,
}

impl<D> Inner<D> {
    fn touch(&mut self, rev: u64) {
        if let Some(pos) = self.order.iter().position(|r| *r == rev) {
            self.order.remove(pos);
        }
        self.order.push_back(rev);
    }

    fn insert(&mut self, rev: u64, contents: D) {
        self.entries.insert(rev, contents);
        self.touch(rev);
        while self.order.len() > CACHE_CAP {
            if let Some(evict) = self.order.pop_front() {
                self.entries.remove(&evict);
            }
        }
    }

    /// Closest cached revision at or below `rev`, or `(0, None)` meaning
    /// "fall back to the empty document".
    fn find_base(&self, rev: u64) -> (u64, Option<D>)
    where
        D: Clone,
    {
        match self.entries.range(..=rev).next_back() {
            Some((base_rev, contents)) => (*base_rev, Some(contents.clone())),
            None => (0, None),
        }
    }
}

pub struct SnapshotCache<D> {
    inner: Mutex<Inner<D>>,
}

impl<D: DeltaAlgebra> SnapshotCache<D> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { entries: BTreeMap::new(), order: VecDeque::new(), in_flight: HashMap::new() }),
        }
    }

    /// Returns the cached snapshot at `rev`, computing it via `compute(base_rev,
    /// base_contents)` if absent. `compute` is only ever invoked once per
    /// revision at a time; concurrent callers for the same revision await the
    /// same result.
    pub async fn get_or_compute<F, Fut>(&self, rev: u64, compute: F) -> Result<Snapshot<D>, BayouError>
    where
        F: FnOnce(u64, D) -> Fut,
        Fut: Future<Output = Result<D, BayouError>>,
    {
        let (base_rev, base_contents, cell) = {
            let mut guard = self.inner.lock().await;
            if let Some(contents) = guard.entries.get(&rev).cloned() {
                guard.touch(rev);
                return Ok(Snapshot { rev_num: rev, contents });
            }
            let cell = guard.in_flight.entry(rev).or_insert_with(|| Arc::new(OnceCell::new())).clone();
            let (base_rev, base_contents) = guard.find_base(rev);
            (base_rev, base_contents.unwrap_or_else(D::identity), cell)
        };

        let result = cell
            .get_or_try_init(|| async { compute(base_rev, base_contents).await.map_err(|e| (e.kind, e.message)) })
            .await
            .map(|contents| contents.clone());

        {
            let mut guard = self.inner.lock().await;
            guard.in_flight.remove(&rev);
            if let Ok(contents) = &result {
                guard.insert(rev, contents.clone());
            }
        }

        result
            .map(|contents| Snapshot { rev_num: rev, contents })
            .map_err(|(kind, message)| BayouError::new(kind, message))
    }
}

impl<D: DeltaAlgebra> Default for SnapshotCache<D> {
    fn default() -> Self {
        Self::new()
    }
}
