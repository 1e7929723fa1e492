//! Fade scheduling.
//!
//! A fade is never applied synchronously. Each job decomposes into one
//! primitive set-opacity op per fadeable part, queued into a single FIFO that
//! executes at most `budget` ops per frame. Ops read their job's opacity when
//! they execute, so a superseding fade reuses ops already in flight.
//!
//! A job runs in passes: when every op of a pass has executed and the fade's
//! duration has not elapsed yet, another pass is queued. The pass queued at or
//! after the end time writes the target opacity; once its ops have all
//! executed the job completes and reports its outcome exactly once.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
};

use sync_shared::{
    entity::EntityId,
    render::{FadePart, VisualBackend, VisualHandle},
};
use tracing::debug;

use crate::pause::{PauseSpan, TimeShift};

/// What happens when a fade completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeOutcome {
    /// Spawn fade-in or return from distance culling finished.
    Shown,
    /// Faded out by distance.
    Hidden,
    /// Death fade finished; release the instance.
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedFade {
    pub entity: EntityId,
    pub handle: VisualHandle,
    pub outcome: FadeOutcome,
}

/// Aggregate opacity transition of one instance.
#[derive(Debug, Clone)]
pub struct FadeJob {
    id: u64,
    entity: EntityId,
    parts: Arc<[FadePart]>,
    from: f32,
    to: f32,
    start: f64,
    duration: f64,
    outcome: FadeOutcome,
    /// Keeps running during a global pause.
    must_finish: bool,
    pending_ops: usize,
    final_pass: bool,
}

impl FadeJob {
    /// Visibility factor in `[0, 1]`; multiplied with each part's authored opacity.
    pub fn factor_at(&self, now: f64) -> f32 {
        if self.duration <= 0.0 {
            return self.to;
        }
        let t = ((now - self.start) / self.duration).clamp(0.0, 1.0) as f32;
        self.from + (self.to - self.from) * t
    }

    pub fn outcome(&self) -> FadeOutcome {
        self.outcome
    }

    fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Parameters for [`FadeScheduler::start`].
#[derive(Debug, Clone)]
pub struct FadeRequest {
    pub entity: EntityId,
    pub handle: VisualHandle,
    pub parts: Arc<[FadePart]>,
    /// Factor to start from when no fade is running for the instance.
    pub from: f32,
    pub to: f32,
    pub duration: f64,
    pub outcome: FadeOutcome,
    pub must_finish: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FadeOp {
    handle: VisualHandle,
    job: u64,
    part: u32,
}

#[derive(Debug, Default)]
pub struct FadeScheduler {
    jobs: BTreeMap<VisualHandle, FadeJob>,
    ops: VecDeque<FadeOp>,
    next_job: u64,
}

impl FadeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a fade, or retargets the instance's running fade.
    ///
    /// A retarget continues from the current factor, replaces the outcome and
    /// keeps ops already queued for the job.
    pub fn start(&mut self, req: FadeRequest, now: f64) {
        if let Some(job) = self.jobs.get_mut(&req.handle) {
            let current = job.factor_at(now);
            job.entity = req.entity;
            job.from = current;
            job.to = req.to;
            job.start = now;
            job.duration = req.duration.max(0.0);
            job.outcome = req.outcome;
            job.must_finish = req.must_finish;
            job.final_pass = false;
            return;
        }
        let id = self.next_job;
        self.next_job += 1;
        let mut job = FadeJob {
            id,
            entity: req.entity,
            parts: req.parts,
            from: req.from.clamp(0.0, 1.0),
            to: req.to,
            start: now,
            duration: req.duration.max(0.0),
            outcome: req.outcome,
            must_finish: req.must_finish,
            pending_ops: 0,
            final_pass: false,
        };
        enqueue_pass(&mut self.ops, req.handle, &mut job, now);
        self.jobs.insert(req.handle, job);
    }

    /// Drops the instance's job without reporting completion. Queued ops for
    /// it are skipped when they reach the head of the queue.
    pub fn cancel(&mut self, handle: VisualHandle) -> bool {
        self.jobs.remove(&handle).is_some()
    }

    pub fn job(&self, handle: VisualHandle) -> Option<&FadeJob> {
        self.jobs.get(&handle)
    }

    pub fn is_fading(&self, handle: VisualHandle) -> bool {
        self.jobs.contains_key(&handle)
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn queued_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn clear(&mut self) {
        self.jobs.clear();
        self.ops.clear();
    }

    /// Runs one frame of fade work. Returns `(completed, ops_executed)`.
    ///
    /// While `paused`, only must-finish jobs advance; ops of other jobs keep
    /// their place in the queue and are not charged to the budget.
    pub fn step<B: VisualBackend>(
        &mut self,
        now: f64,
        budget: usize,
        backend: &mut B,
        paused: bool,
    ) -> (Vec<CompletedFade>, usize) {
        let mut completed = Vec::new();

        // Queue the next pass for jobs whose previous pass has drained.
        let mut done = Vec::new();
        for (handle, job) in self.jobs.iter_mut() {
            if job.pending_ops > 0 || (paused && !job.must_finish) {
                continue;
            }
            if job.final_pass {
                done.push(*handle);
            } else {
                enqueue_pass(&mut self.ops, *handle, job, now);
                if job.final_pass && job.pending_ops == 0 {
                    done.push(*handle);
                }
            }
        }
        for handle in done {
            self.complete(handle, &mut completed);
        }

        let mut executed = 0;
        let mut charged = 0;
        let mut deferred = Vec::new();
        while charged < budget {
            let Some(op) = self.ops.pop_front() else {
                break;
            };
            let Some(job) = self.jobs.get_mut(&op.handle).filter(|j| j.id == op.job) else {
                charged += 1;
                continue;
            };
            // Held ops cost nothing, or a backlog would starve death fades.
            if paused && !job.must_finish {
                deferred.push(op);
                continue;
            }
            charged += 1;
            if let Some(part) = job.parts.get(op.part as usize) {
                backend.set_part_opacity(op.handle, part.part, part.authored_opacity * job.factor_at(now));
            }
            executed += 1;
            job.pending_ops = job.pending_ops.saturating_sub(1);
            if job.pending_ops == 0 && job.final_pass {
                self.complete(op.handle, &mut completed);
            }
        }
        for op in deferred.into_iter().rev() {
            self.ops.push_front(op);
        }

        (completed, executed)
    }

    fn complete(&mut self, handle: VisualHandle, out: &mut Vec<CompletedFade>) {
        if let Some(job) = self.jobs.remove(&handle) {
            debug!(entity = ?job.entity, ?handle, outcome = ?job.outcome, "Fade complete");
            out.push(CompletedFade {
                entity: job.entity,
                handle,
                outcome: job.outcome,
            });
        }
    }
}

fn enqueue_pass(ops: &mut VecDeque<FadeOp>, handle: VisualHandle, job: &mut FadeJob, now: f64) {
    job.final_pass = now >= job.end();
    let before = ops.len();
    ops.extend(
        (0..job.parts.len())
            .map_while(|i| u32::try_from(i).ok())
            .map(|part| FadeOp {
                handle,
                job: job.id,
                part,
            }),
    );
    job.pending_ops = ops.len() - before;
}

impl TimeShift for FadeScheduler {
    fn shift_time(&mut self, span: &PauseSpan) {
        for job in self.jobs.values_mut() {
            if !job.must_finish {
                job.start += span.offset(job.start);
            }
        }
    }
}
