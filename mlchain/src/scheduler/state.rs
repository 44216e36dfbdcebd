//! Dispatch bookkeeping for one run.
//!
//! The executor's run loop owns the state and applies every transition on a
//! single task, so the ready set, the running set and stage statuses are
//! always consistent with each other. Workers never touch it.

use std::collections::BTreeSet;

use crate::core::{RemoteId, Stage, StageId, StageKind, StageStatus};
use crate::errors::StageError;
use crate::pipeline::PipelineGraph;
use crate::resume::ResumeSnapshot;

/// How a stage was satisfied before dispatch began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presatisfied {
    /// The stage references a resource that already existed.
    Existing {
        /// The stage.
        stage_id: StageId,
        /// The referenced resource.
        remote_id: RemoteId,
    },
    /// The execution log recorded the stage as completed.
    Resumed {
        /// The stage.
        stage_id: StageId,
        /// The logged resource.
        remote_id: RemoteId,
    },
}

/// A stage handed to a worker.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Position in insertion order.
    pub pos: usize,
    /// A copy of the stage.
    pub stage: Stage,
    /// Input ids with their kinds, in input order.
    pub inputs: Vec<(StageId, StageKind)>,
}

/// Scheduler state: stage statuses, the ready set and the running set.
#[derive(Debug)]
pub struct SchedulerState {
    stages: Vec<Stage>,
    dependents: Vec<Vec<usize>>,
    /// Unsatisfied input count per stage.
    waiting_on: Vec<usize>,
    /// Ready positions. Lowest position, i.e. earliest inserted, goes first.
    ready: BTreeSet<usize>,
    running: BTreeSet<usize>,
    ceiling: usize,
    peak_running: usize,
    halted: bool,
}

impl SchedulerState {
    /// Builds the initial state. Stages without inputs start ready.
    #[must_use]
    pub fn new(graph: &PipelineGraph, ceiling: usize) -> Self {
        let stages = graph.stages().to_vec();
        let waiting_on: Vec<usize> = stages.iter().map(|s| s.inputs.len()).collect();
        let mut state = Self {
            dependents: graph.dependents(),
            waiting_on,
            stages,
            ready: BTreeSet::new(),
            running: BTreeSet::new(),
            ceiling: ceiling.max(1),
            peak_running: 0,
            halted: false,
        };
        for pos in 0..state.stages.len() {
            if state.waiting_on[pos] == 0 {
                state.make_ready(pos);
            }
        }
        state
    }

    /// Marks existing-resource stages succeeded and logged stages resumed.
    ///
    /// Returns what was satisfied, in insertion order.
    pub fn apply_resume(&mut self, snapshot: &ResumeSnapshot) -> Vec<Presatisfied> {
        let mut satisfied = Vec::new();
        for pos in 0..self.stages.len() {
            let stage = &self.stages[pos];
            let (status, entry) = if let Some(remote_id) = stage.params.existing_remote_id() {
                (
                    StageStatus::Succeeded,
                    Presatisfied::Existing {
                        stage_id: stage.id.clone(),
                        remote_id: remote_id.clone(),
                    },
                )
            } else if stage.resource_kind().is_some() {
                let Some(remote_id) = snapshot.completed(&stage.id) else {
                    continue;
                };
                (
                    StageStatus::SkippedResumed,
                    Presatisfied::Resumed {
                        stage_id: stage.id.clone(),
                        remote_id: remote_id.clone(),
                    },
                )
            } else {
                continue;
            };

            let remote_id = match &entry {
                Presatisfied::Existing { remote_id, .. } | Presatisfied::Resumed { remote_id, .. } => {
                    remote_id.clone()
                }
            };
            self.ready.remove(&pos);
            let stage = &mut self.stages[pos];
            stage.status = status;
            stage.remote_id = Some(remote_id);
            self.unblock_dependents(pos);
            satisfied.push(entry);
        }
        satisfied
    }

    /// Takes the earliest ready stage if a slot is free.
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        if self.halted || self.running.len() >= self.ceiling {
            return None;
        }
        let pos = self.ready.pop_first()?;
        self.running.insert(pos);
        self.peak_running = self.peak_running.max(self.running.len());

        let stage = &mut self.stages[pos];
        stage.status = StageStatus::Running;
        let stage = stage.clone();
        let inputs = stage
            .inputs
            .iter()
            .filter_map(|id| self.stages.iter().find(|s| &s.id == id))
            .map(|s| (s.id.clone(), s.kind()))
            .collect();
        Some(Dispatch { pos, stage, inputs })
    }

    /// Records success and returns the stages that became ready.
    ///
    /// A stage already failed by the pipeline deadline stays failed.
    pub fn complete(&mut self, pos: usize, remote_id: Option<RemoteId>) -> Vec<usize> {
        self.running.remove(&pos);
        let stage = &mut self.stages[pos];
        if stage.status != StageStatus::Running {
            return Vec::new();
        }
        stage.status = StageStatus::Succeeded;
        stage.remote_id = remote_id;
        self.unblock_dependents(pos)
    }

    /// Records a failure and fails every transitive dependent.
    ///
    /// Returns the positions failed as a consequence, in insertion order.
    pub fn fail(&mut self, pos: usize, error: StageError) -> Vec<usize> {
        self.running.remove(&pos);
        if self.stages[pos].status.is_terminal() {
            return Vec::new();
        }
        self.mark_failed(pos, error);

        let failed_id = self.stages[pos].id.to_string();
        let mut downstream = BTreeSet::new();
        let mut stack = self.dependents[pos].clone();
        while let Some(next) = stack.pop() {
            if self.stages[next].status.is_terminal() || !downstream.insert(next) {
                continue;
            }
            stack.extend(self.dependents[next].iter().copied());
        }
        for &next in &downstream {
            self.ready.remove(&next);
            self.mark_failed(next, StageError::upstream(&failed_id));
        }
        downstream.into_iter().collect()
    }

    /// Records a stage interrupted by cancellation. Dependents are left as
    /// they are so that a later run can pick them up.
    pub fn interrupt(&mut self, pos: usize, error: StageError) {
        self.running.remove(&pos);
        if !self.stages[pos].status.is_terminal() {
            self.mark_failed(pos, error);
        }
    }

    /// Fails every stage that has not reached a terminal status.
    ///
    /// Running stages stay in the running set until their worker returns.
    pub fn expire(&mut self, error: &StageError) -> Vec<usize> {
        self.halted = true;
        self.ready.clear();
        let expired: Vec<usize> = (0..self.stages.len())
            .filter(|&pos| !self.stages[pos].status.is_terminal())
            .collect();
        for &pos in &expired {
            self.mark_failed(pos, error.clone());
        }
        expired
    }

    /// Stops further dispatch.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    /// Returns true if dispatch was stopped.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Stages currently executing.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.len()
    }

    /// Most stages ever executing at once.
    #[must_use]
    pub fn peak_running(&self) -> usize {
        self.peak_running
    }

    /// Stages waiting for a slot.
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// The stage at `pos`.
    #[must_use]
    pub fn stage(&self, pos: usize) -> &Stage {
        &self.stages[pos]
    }

    /// All stages in insertion order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn make_ready(&mut self, pos: usize) {
        self.stages[pos].status = StageStatus::ReadyToRun;
        self.ready.insert(pos);
    }

    fn mark_failed(&mut self, pos: usize, error: StageError) {
        let stage = &mut self.stages[pos];
        stage.status = StageStatus::Failed;
        stage.error = Some(error);
    }

    fn unblock_dependents(&mut self, pos: usize) -> Vec<usize> {
        let mut unblocked = Vec::new();
        for i in 0..self.dependents[pos].len() {
            let next = self.dependents[pos][i];
            self.waiting_on[next] = self.waiting_on[next].saturating_sub(1);
            if self.waiting_on[next] == 0 && self.stages[next].status == StageStatus::Pending {
                self.make_ready(next);
                unblocked.push(next);
            }
        }
        unblocked
    }
}
