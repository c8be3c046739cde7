use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use autox_debug_proto::{DebugPoint, SourceLocation};
use parking_lot::RwLock;

use crate::context::{is_truthy, DebugHost, ExecutionContext};
use crate::error::{panic_message, DebugResult};
use crate::live_point::{LivePausePoint, LivePoints};
use crate::outbox::Outbox;

/// Registered debug points plus the live pause points created from them.
///
/// Interpreter threads call [`DebugPointRegistry::check_for_debug_point`] before executing
/// each location; the connection's reader loop mutates the registered points and routes
/// requests to live points by id.
pub struct DebugPointRegistry {
    host: Arc<dyn DebugHost>,
    outbox: Arc<Outbox>,
    /// path -> line -> point
    points: RwLock<HashMap<String, HashMap<u32, DebugPoint>>>,
    point_count: AtomicUsize,
    live: Arc<LivePoints>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for DebugPointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugPointRegistry")
            .field("points", &self.point_count.load(Ordering::Relaxed))
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl DebugPointRegistry {
    pub fn new(host: Arc<dyn DebugHost>) -> Arc<Self> {
        Self::with_outbox(host, Arc::new(Outbox::new()))
    }

    pub fn with_outbox(host: Arc<dyn DebugHost>, outbox: Arc<Outbox>) -> Arc<Self> {
        Arc::new(Self {
            host,
            outbox,
            points: RwLock::new(HashMap::new()),
            point_count: AtomicUsize::new(0),
            live: Arc::new(LivePoints::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn add_points(&self, points: impl IntoIterator<Item = DebugPoint>) {
        let mut map = self.points.write();
        for point in points {
            tracing::debug!(target: "autox.debug", location = %point.key(), "debug point added");
            map.entry(point.path.clone())
                .or_default()
                .insert(point.line, point);
        }
        self.point_count
            .store(map.values().map(HashMap::len).sum(), Ordering::Release);
    }

    /// Remove points by location. Live pause points created from them are unaffected.
    pub fn remove_points<'a>(&self, points: impl IntoIterator<Item = &'a DebugPoint>) {
        let mut map = self.points.write();
        for point in points {
            let Some(lines) = map.get_mut(point.path.as_str()) else {
                continue;
            };
            if lines.remove(&point.line).is_some() {
                tracing::debug!(
                    target: "autox.debug",
                    location = %point.key(),
                    "debug point removed"
                );
            }
            if lines.is_empty() {
                map.remove(point.path.as_str());
            }
        }
        self.point_count
            .store(map.values().map(HashMap::len).sum(), Ordering::Release);
    }

    /// Registered points sorted by path then line.
    pub fn points(&self) -> Vec<DebugPoint> {
        let map = self.points.read();
        let mut points: Vec<DebugPoint> = map
            .values()
            .flat_map(|lines| lines.values().cloned())
            .collect();
        points.sort_by(|a, b| a.path.cmp(&b.path).then(a.line.cmp(&b.line)));
        points
    }

    pub fn is_point(&self, location: &SourceLocation) -> bool {
        self.points
            .read()
            .get(location.path.as_str())
            .is_some_and(|lines| lines.contains_key(&location.line))
    }

    pub fn check_for_debug_point(
        &self,
        location: &SourceLocation,
        ctx: &dyn ExecutionContext,
    ) -> DebugResult<()> {
        self.check_for_debug_point_with(location, ctx, |_| {})
    }

    /// Like [`DebugPointRegistry::check_for_debug_point`]; `on_pause` runs after a new live
    /// point is registered and before the thread parks.
    pub fn check_for_debug_point_with(
        &self,
        location: &SourceLocation,
        ctx: &dyn ExecutionContext,
        on_pause: impl FnOnce(&Arc<LivePausePoint>),
    ) -> DebugResult<()> {
        if self.point_count.load(Ordering::Acquire) == 0 && self.live.is_idle() {
            return Ok(());
        }

        let thread = thread::current().id();
        if let Some(point) = self.live.for_thread(thread) {
            return point.check_for_pause(location, ctx);
        }

        if self.live.take_reentry(thread, location) {
            tracing::debug!(
                target: "autox.debug",
                location = %location,
                "skipping location just released by step-return"
            );
            return Ok(());
        }

        let condition = {
            let map = self.points.read();
            let Some(point) = map
                .get(location.path.as_str())
                .and_then(|lines| lines.get(&location.line))
            else {
                return Ok(());
            };
            point.condition.clone()
        };

        if self.outbox.is_closed() {
            tracing::debug!(
                target: "autox.debug",
                location = %location,
                "debug point hit with no debugger attached"
            );
            return Ok(());
        }

        if let Some(condition) = condition {
            if !self.condition_holds(location, ctx, &condition) {
                return Ok(());
            }
        }

        let id = format!("lp-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let point = Arc::new(LivePausePoint::new(
            id,
            self.host.clone(),
            self.outbox.clone(),
            Arc::downgrade(&self.live),
        ));
        if !self.live.insert(point.clone()) {
            tracing::debug!(
                target: "autox.debug",
                location = %location,
                "debug point hit after the debugger went away"
            );
            return Ok(());
        }
        tracing::debug!(
            target: "autox.debug",
            point_id = %point.id(),
            location = %location,
            "debug point hit"
        );
        on_pause(&point);
        point.pause(location, ctx)
    }

    fn condition_holds(
        &self,
        location: &SourceLocation,
        ctx: &dyn ExecutionContext,
        condition: &str,
    ) -> bool {
        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.host.evaluate(ctx, condition)));
        let error = match outcome {
            Ok(Ok(value)) => return is_truthy(&value),
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => panic_message(panic.as_ref()),
        };
        // A broken condition pauses so the user sees it.
        tracing::warn!(
            target: "autox.debug",
            location = %location,
            error = %error,
            "debug point condition failed to evaluate"
        );
        true
    }

    pub fn live_point(&self, id: &str) -> Option<Arc<LivePausePoint>> {
        self.live.get(id)
    }

    pub fn live_point_for_current_thread(&self) -> Option<Arc<LivePausePoint>> {
        self.live.for_thread(thread::current().id())
    }

    pub fn live_points(&self) -> Vec<Arc<LivePausePoint>> {
        self.live.all()
    }

    /// Drop the calling thread's live point (its flow finished). Returns whether one existed.
    pub fn detach_current_thread(&self) -> bool {
        let thread = thread::current().id();
        let point = self.live.for_thread(thread);
        match point {
            Some(point) => {
                self.live.detach(thread, point.id(), None);
                point.release();
                true
            }
            None => {
                self.live.clear_reentry(thread);
                false
            }
        }
    }

    /// Release every live point, waking any parked thread.
    pub fn release_all(&self) -> usize {
        let points = self.live.drain();
        let mut released = 0;
        for point in &points {
            if point.release() {
                released += 1;
                tracing::info!(
                    target: "autox.debug",
                    point_id = %point.id(),
                    thread = %point.thread_name(),
                    "releasing live point"
                );
            }
        }
        released
    }
}
