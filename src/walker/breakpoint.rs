//! Breakpoints: predicates over a visited vertex that pause the walk.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::Error;

use super::{SourceRange, VertexState};

/// The outcome of probing one breakpoint against a vertex.
#[derive(Debug, Clone, Default)]
pub struct BreakpointHit {
    /// Whether the breakpoint fired.
    pub hit: bool,
    /// The source ranges responsible for the hit.
    pub ranges: Vec<SourceRange>,
}

/// A predicate over `(vertex, state, last error)` pausing the walk when it
/// holds. Implementations must be cheap; they run on every vertex.
#[async_trait::async_trait]
pub trait Breakpoint: Send + Sync + fmt::Display {
    /// Reset internal state before a walk starts.
    fn init(&self) {}

    /// Whether the breakpoint fires for the vertex just handled.
    async fn is_target(
        &self,
        state: &VertexState,
        last_err: Option<&Error>,
    ) -> Result<BreakpointHit, Error>;

    /// Whether the breakpoint marks the given source line, for display.
    fn is_marked(&self, _line: i64) -> bool {
        false
    }
}

/// Pauses when a vertex's source ranges contain the given line.
#[derive(Debug)]
pub struct LineBreakpoint {
    filename: String,
    line: i64,
}

impl LineBreakpoint {
    /// A breakpoint on `line` of `filename`. An empty filename matches any
    /// file.
    pub fn new(filename: String, line: i64) -> LineBreakpoint {
        LineBreakpoint { filename, line }
    }
}

impl fmt::Display for LineBreakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filename.is_empty() {
            write!(f, "line {}", self.line)
        } else {
            write!(f, "{}:{}", self.filename, self.line)
        }
    }
}

#[async_trait::async_trait]
impl Breakpoint for LineBreakpoint {
    async fn is_target(
        &self,
        state: &VertexState,
        _last_err: Option<&Error>,
    ) -> Result<BreakpointHit, Error> {
        let ranges: Vec<SourceRange> = state
            .ranges
            .iter()
            .filter(|r| {
                (self.filename.is_empty() || r.filename == self.filename)
                    && r.start_line <= self.line
                    && self.line <= r.end_line
            })
            .cloned()
            .collect();
        Ok(BreakpointHit {
            hit: !ranges.is_empty(),
            ranges,
        })
    }

    fn is_marked(&self, line: i64) -> bool {
        self.line == line
    }
}

/// Pauses exactly once, on the first vertex the walk visits.
#[derive(Debug, Default)]
pub struct StopOnEntry {
    seen: AtomicBool,
}

impl StopOnEntry {
    /// A fresh stop-on-entry breakpoint.
    pub fn new() -> StopOnEntry {
        StopOnEntry::default()
    }
}

impl fmt::Display for StopOnEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("stop on entry")
    }
}

#[async_trait::async_trait]
impl Breakpoint for StopOnEntry {
    fn init(&self) {
        self.seen.store(false, Ordering::SeqCst);
    }

    async fn is_target(
        &self,
        state: &VertexState,
        _last_err: Option<&Error>,
    ) -> Result<BreakpointHit, Error> {
        let first = !self.seen.swap(true, Ordering::SeqCst);
        Ok(BreakpointHit {
            hit: first,
            ranges: state.ranges.clone(),
        })
    }
}

/// Pauses whenever the vertex handler returned an error.
#[derive(Debug, Default)]
pub struct OnError;

impl fmt::Display for OnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("on error")
    }
}

#[async_trait::async_trait]
impl Breakpoint for OnError {
    async fn is_target(
        &self,
        state: &VertexState,
        last_err: Option<&Error>,
    ) -> Result<BreakpointHit, Error> {
        Ok(BreakpointHit {
            hit: last_err.is_some(),
            ranges: state.ranges.clone(),
        })
    }
}

/// A keyed set of breakpoints shared between the walker and its controller.
#[derive(Default)]
pub struct BreakpointSet {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    breakpoints: BTreeMap<String, Arc<dyn Breakpoint>>,
    next_key: u64,
}

impl fmt::Debug for BreakpointSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_map()
            .entries(inner.breakpoints.iter().map(|(k, b)| (k, b.to_string())))
            .finish()
    }
}

impl BreakpointSet {
    /// An empty set.
    pub fn new() -> BreakpointSet {
        BreakpointSet::default()
    }

    /// Add a breakpoint under an auto-generated key, returned to the
    /// caller.
    pub fn add(&self, breakpoint: Arc<dyn Breakpoint>) -> String {
        let mut inner = self.inner.lock().unwrap();
        let key = loop {
            let candidate = inner.next_key.to_string();
            inner.next_key += 1;
            if !inner.breakpoints.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.breakpoints.insert(key.clone(), breakpoint);
        key
    }

    /// Add a breakpoint under an explicit key, replacing any previous one.
    pub fn add_keyed(&self, key: String, breakpoint: Arc<dyn Breakpoint>) {
        self.inner.lock().unwrap().breakpoints.insert(key, breakpoint);
    }

    /// Remove one breakpoint.
    pub fn remove(&self, key: &str) {
        self.inner.lock().unwrap().breakpoints.remove(key);
    }

    /// Drop every breakpoint.
    pub fn clear(&self) {
        self.inner.lock().unwrap().breakpoints.clear();
    }

    /// Snapshot of the set, in key order.
    pub fn list(&self) -> Vec<(String, Arc<dyn Breakpoint>)> {
        self.inner
            .lock()
            .unwrap()
            .breakpoints
            .iter()
            .map(|(k, b)| (k.clone(), Arc::clone(b)))
            .collect()
    }

    /// Reset every breakpoint's internal state.
    pub fn init_all(&self) {
        for (_, breakpoint) in self.list() {
            breakpoint.init();
        }
    }

    /// Probe every breakpoint against a handled vertex, returning whether
    /// any fired and the ranges that fired per key.
    pub async fn check(
        &self,
        state: &VertexState,
        last_err: Option<&Error>,
    ) -> Result<(bool, HashMap<String, Vec<SourceRange>>), Error> {
        let mut hits = HashMap::new();
        let mut any = false;
        for (key, breakpoint) in self.list() {
            let outcome = breakpoint.is_target(state, last_err).await?;
            if outcome.hit {
                any = true;
                hits.insert(key, outcome.ranges);
            }
        }
        Ok((any, hits))
    }

    /// Whether any breakpoint marks the given line.
    pub fn is_marked(&self, line: i64) -> bool {
        self.list().iter().any(|(_, b)| b.is_marked(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(ranges: Vec<SourceRange>) -> VertexState {
        VertexState {
            digest: String::from("sha256:v1"),
            name: String::from("RUN make"),
            ranges,
        }
    }

    fn range(start: i64, end: i64) -> SourceRange {
        SourceRange {
            filename: String::from("Dockerfile"),
            start_line: start,
            end_line: end,
        }
    }

    #[tokio::test]
    async fn line_breakpoint_matches_containing_ranges() {
        let bp = LineBreakpoint::new(String::from("Dockerfile"), 4);
        let hit = bp
            .is_target(&state(vec![range(2, 6), range(8, 9)]), None)
            .await
            .unwrap();
        assert!(hit.hit);
        assert_eq!(hit.ranges, vec![range(2, 6)]);

        let miss = bp.is_target(&state(vec![range(8, 9)]), None).await.unwrap();
        assert!(!miss.hit);
    }

    #[tokio::test]
    async fn stop_on_entry_fires_once_per_walk() {
        let bp = StopOnEntry::new();
        assert!(bp.is_target(&state(vec![]), None).await.unwrap().hit);
        assert!(!bp.is_target(&state(vec![]), None).await.unwrap().hit);
        bp.init();
        assert!(bp.is_target(&state(vec![]), None).await.unwrap().hit);
    }

    #[tokio::test]
    async fn on_error_fires_only_with_an_error() {
        let bp = OnError;
        let err = Error::invalid("boom");
        assert!(bp.is_target(&state(vec![]), Some(&err)).await.unwrap().hit);
        assert!(!bp.is_target(&state(vec![]), None).await.unwrap().hit);
    }

    #[tokio::test]
    async fn set_reports_hits_per_key() {
        let set = BreakpointSet::new();
        let key = set.add(Arc::new(LineBreakpoint::new(String::new(), 3)));
        set.add(Arc::new(OnError));

        let (any, hits) = set.check(&state(vec![range(1, 5)]), None).await.unwrap();
        assert!(any);
        assert_eq!(hits.len(), 1);
        assert!(hits.contains_key(&key));
        assert!(set.is_marked(3));
        assert!(!set.is_marked(4));
    }
}
