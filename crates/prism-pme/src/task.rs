//! Handle for a launched PME step.

use crate::output::PmeOutput;
use crate::pme::{GpuTaskCompletion, Pme};
use anyhow::Result;
use prism_core::{EnergyData, ForceWithVirial, StepWorkload};

/// Results of a step whose stages have all been launched.
///
/// Every consuming method takes the handle by value, so a step is finished
/// at most once. Polling gives the handle back while work is outstanding.
/// On backends without stream query support [`PendingStep::try_get`] blocks
/// until the step is done.
#[must_use = "a launched PME step must be finished before the next one"]
pub struct PendingStep<'a> {
    pme: &'a mut Pme,
    step_work: StepWorkload,
    lambda_q: f64,
}

pub enum StepPoll<'a> {
    Ready(PmeOutput),
    Pending(PendingStep<'a>),
}

impl<'a> PendingStep<'a> {
    pub(crate) fn new(pme: &'a mut Pme, step_work: StepWorkload, lambda_q: f64) -> Self {
        Self {
            pme,
            step_work,
            lambda_q,
        }
    }

    pub fn step_work(&self) -> &StepWorkload {
        &self.step_work
    }

    /// Non-blocking completion check.
    pub fn try_get(self) -> Result<StepPoll<'a>> {
        if self.pme.poll_completion(GpuTaskCompletion::Check)? {
            Ok(StepPoll::Ready(self.get()?))
        } else {
            Ok(StepPoll::Pending(self))
        }
    }

    /// Blocks until the outputs are available.
    pub fn get(self) -> Result<PmeOutput> {
        let compute_ev = self.step_work.compute_energy_and_virial();
        self.pme.wait_finish_task(compute_ev, self.lambda_q)
    }

    /// Blocks, then reduces the outputs into the caller's accumulators.
    pub fn reduce_into(self, force_with_virial: &mut ForceWithVirial, enerd: &mut EnergyData) -> Result<()> {
        self.pme
            .wait_and_reduce(&self.step_work, force_with_virial, enerd, self.lambda_q)
    }
}
