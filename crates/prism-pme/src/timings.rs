//! Wall-clock accounting of PME stages.

use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PmeStage {
    BoxUpdate,
    Spread,
    SpreadSync,
    FftRealToComplex,
    Solve,
    FftComplexToReal,
    Gather,
    WaitGather,
    Reduction,
}

impl PmeStage {
    pub const ALL: [PmeStage; 9] = [
        PmeStage::BoxUpdate,
        PmeStage::Spread,
        PmeStage::SpreadSync,
        PmeStage::FftRealToComplex,
        PmeStage::Solve,
        PmeStage::FftComplexToReal,
        PmeStage::Gather,
        PmeStage::WaitGather,
        PmeStage::Reduction,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StageTiming {
    pub calls: u64,
    pub total: Duration,
}

/// Accumulated stage timings. Accelerator stages measure launch and
/// synchronisation time on the host, not kernel time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PmeTimings {
    stages: [StageTiming; 9],
}

impl PmeTimings {
    pub fn record(&mut self, stage: PmeStage, elapsed: Duration) {
        let slot = &mut self.stages[stage.slot()];
        slot.calls += 1;
        slot.total += elapsed;
    }

    /// Times `f` and records it under `stage`.
    pub fn time<R>(&mut self, stage: PmeStage, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let result = f();
        self.record(stage, start.elapsed());
        result
    }

    pub fn get(&self, stage: PmeStage) -> StageTiming {
        self.stages[stage.slot()]
    }

    pub fn total(&self) -> Duration {
        self.stages.iter().map(|s| s.total).sum()
    }

    pub fn reset(&mut self) {
        self.stages = Default::default();
    }

    pub fn iter(&self) -> impl Iterator<Item = (PmeStage, StageTiming)> + '_ {
        PmeStage::ALL.iter().map(move |&s| (s, self.get(s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let mut timings = PmeTimings::default();
        timings.record(PmeStage::Solve, Duration::from_millis(3));
        timings.record(PmeStage::Solve, Duration::from_millis(2));
        let value = timings.time(PmeStage::Gather, || 42);
        assert_eq!(value, 42);
        assert_eq!(timings.get(PmeStage::Solve).calls, 2);
        assert_eq!(timings.get(PmeStage::Solve).total, Duration::from_millis(5));
        assert_eq!(timings.get(PmeStage::Gather).calls, 1);
        assert_eq!(timings.iter().count(), PmeStage::ALL.len());
        timings.reset();
        assert_eq!(timings.total(), Duration::ZERO);
        assert_eq!(timings.get(PmeStage::Solve).calls, 0);
    }
}
