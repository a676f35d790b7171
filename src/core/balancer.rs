//! Load-balancing strategies for picking an idle worker.

use crate::config::LoadBalancing;
use crate::protocol::WorkerId;
use rand::Rng;

/// What a strategy knows about an idle worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerCandidate {
    /// Worker identifier
    pub id: WorkerId,
    /// Tasks the worker has finished so far
    pub tasks_completed: u64,
}

/// Picks one worker among the idle candidates.
///
/// Candidates are passed sorted by worker id. Returning `None` leaves the
/// task queued until the next dispatch attempt.
pub trait LoadBalancer: Send {
    /// Choose a worker for the next task
    fn select(&mut self, candidates: &[WorkerCandidate]) -> Option<WorkerId>;

    /// Strategy name for logs
    fn name(&self) -> &'static str;
}

/// Cycles through idle workers in id order
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Option<WorkerId>,
}

impl LoadBalancer for RoundRobin {
    fn select(&mut self, candidates: &[WorkerCandidate]) -> Option<WorkerId> {
        let next = match self.last {
            Some(last) => candidates
                .iter()
                .find(|c| c.id > last)
                .or_else(|| candidates.first()),
            None => candidates.first(),
        }?;
        self.last = Some(next.id);
        Some(next.id)
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Idle worker with the fewest completed tasks; ties go to the lowest id
#[derive(Debug, Default)]
pub struct LeastBusy;

impl LoadBalancer for LeastBusy {
    fn select(&mut self, candidates: &[WorkerCandidate]) -> Option<WorkerId> {
        candidates
            .iter()
            .min_by_key(|c| (c.tasks_completed, c.id))
            .map(|c| c.id)
    }

    fn name(&self) -> &'static str {
        "least-busy"
    }
}

/// Uniformly random idle worker
#[derive(Debug, Default)]
pub struct RandomChoice;

impl LoadBalancer for RandomChoice {
    fn select(&mut self, candidates: &[WorkerCandidate]) -> Option<WorkerId> {
        if candidates.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        Some(candidates[rng.random_range(0..candidates.len())].id)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Build the strategy named in configuration.
pub fn for_strategy(strategy: LoadBalancing) -> Box<dyn LoadBalancer> {
    match strategy {
        LoadBalancing::RoundRobin => Box::new(RoundRobin::default()),
        LoadBalancing::LeastBusy => Box::new(LeastBusy),
        LoadBalancing::Random => Box::new(RandomChoice),
    }
}
