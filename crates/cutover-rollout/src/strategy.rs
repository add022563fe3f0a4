//! Deployment strategies compiled to plans of formation swaps.
//!
//! A [`Plan`] is a sequence of [`Step`]s. Each step carries the complete
//! formation to write and the job events that confirm it. The engine runs
//! every strategy through the same mutate, wait, emit loop.

use cutover_core::{DeploymentStrategy, Formation, JobState};

use crate::matcher::ExpectedEvents;

/// One formation overwrite and the job events that confirm it.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub formation: Formation,
    pub expect: ExpectedEvents,
}

/// Ordered steps for one deployment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

pub trait StrategyPlan {
    /// Build the plan that moves `old` capacity onto `new`.
    ///
    /// `new` is the new release's formation as currently stored (empty when
    /// none exists), so a redelivered deployment continues from where the
    /// previous run stopped.
    fn plan(&self, old: &Formation, new: &Formation) -> Plan;
}

impl StrategyPlan for DeploymentStrategy {
    fn plan(&self, old: &Formation, new: &Formation) -> Plan {
        match self {
            DeploymentStrategy::OneByOne => one_by_one(old, new),
            DeploymentStrategy::AllAtOnce => all_at_once(old, new),
        }
    }
}

/// Start one new instance, then stop one old instance, per unit.
///
/// Types are visited in lexicographic order. The new and old maps carry
/// over between types, so every write is the full desired formation.
fn one_by_one(old: &Formation, new: &Formation) -> Plan {
    let mut old_formation = old.clone();
    let mut new_formation = Formation::new(&new.app_id, &new.release_id, new.processes.clone());
    let mut steps = Vec::new();

    for (process_type, &count) in &old.processes {
        for _ in 0..count {
            let n = new_formation.processes.entry(process_type.clone()).or_insert(0);
            *n = n.saturating_add(1);
            steps.push(Step {
                formation: new_formation.clone(),
                expect: ExpectedEvents::for_release(&new_formation.release_id)
                    .expect(process_type, JobState::Up, 1),
            });

            if let Some(n) = old_formation.processes.get_mut(process_type) {
                *n = n.saturating_sub(1);
            }
            steps.push(Step {
                formation: old_formation.clone(),
                expect: ExpectedEvents::for_release(&old_formation.release_id)
                    .expect(process_type, JobState::Down, 1),
            });
        }
    }

    Plan { steps }
}

/// Start the full new formation, then stop the full old one.
fn all_at_once(old: &Formation, new: &Formation) -> Plan {
    let mut steps = Vec::new();

    let mut started = Formation::new(&new.app_id, &new.release_id, new.processes.clone());
    let mut expect_up = ExpectedEvents::for_release(&new.release_id);
    for (process_type, &count) in &old.processes {
        let target = new.count(process_type).saturating_add(count);
        started.processes.insert(process_type.clone(), target);
        expect_up.add(process_type, JobState::Up, count);
    }
    if !expect_up.is_satisfied() {
        steps.push(Step {
            formation: started,
            expect: expect_up,
        });
    }

    let mut stopped = old.clone();
    let mut expect_down = ExpectedEvents::for_release(&old.release_id);
    for (process_type, count) in stopped.processes.iter_mut() {
        expect_down.add(process_type, JobState::Down, *count);
        *count = 0;
    }
    if !expect_down.is_satisfied() {
        steps.push(Step {
            formation: stopped,
            expect: expect_down,
        });
    }

    Plan { steps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn formation(release: &str, counts: &[(&str, u32)]) -> Formation {
        let processes: BTreeMap<String, u32> =
            counts.iter().map(|(t, n)| (t.to_string(), *n)).collect();
        Formation::new("app", release, processes)
    }

    /// Total running capacity per type after each step, assuming every
    /// step is confirmed before the next is written.
    fn capacity_history(plan: &Plan, old: &Formation, new: &Formation) -> Vec<BTreeMap<String, u32>> {
        let mut old_now = old.clone();
        let mut new_now = new.clone();
        let mut history = Vec::new();
        for step in &plan.steps {
            if step.formation.release_id == old.release_id {
                old_now = step.formation.clone();
            } else {
                new_now = step.formation.clone();
            }
            let mut totals = BTreeMap::new();
            for t in old.processes.keys() {
                totals.insert(t.clone(), old_now.count(t) + new_now.count(t));
            }
            history.push(totals);
        }
        history
    }

    #[test]
    fn one_by_one_alternates_up_and_down() {
        let old = formation("r1", &[("web", 3)]);
        let new = Formation::empty("app", "r2");
        let plan = DeploymentStrategy::OneByOne.plan(&old, &new);

        assert_eq!(plan.len(), 6);
        for (i, step) in plan.steps.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(step.formation.release_id, "r2");
                assert_eq!(step.formation.count("web"), (i as u32 / 2) + 1);
                assert_eq!(step.expect.remaining("web", JobState::Up), 1);
            } else {
                assert_eq!(step.formation.release_id, "r1");
                assert_eq!(step.formation.count("web"), 3 - (i as u32 / 2) - 1);
                assert_eq!(step.expect.remaining("web", JobState::Down), 1);
            }
        }

        let last = plan.steps.last().unwrap();
        assert_eq!(last.formation.count("web"), 0);
        assert!(last.formation.processes.contains_key("web"));
    }

    #[test]
    fn one_by_one_keeps_capacity_within_one_extra() {
        let old = formation("r1", &[("web", 4), ("worker", 2)]);
        let new = Formation::empty("app", "r2");
        let plan = DeploymentStrategy::OneByOne.plan(&old, &new);

        for totals in capacity_history(&plan, &old, &new) {
            for (t, total) in totals {
                let n = old.count(&t);
                assert!(total == n || total == n + 1, "{t}: {total} not in {{{n}, {}}}", n + 1);
            }
        }
    }

    #[test]
    fn one_by_one_expects_n_up_and_n_down_per_type() {
        let old = formation("r1", &[("clock", 1), ("web", 3), ("worker", 2)]);
        let plan = DeploymentStrategy::OneByOne.plan(&old, &Formation::empty("app", "r2"));

        for (t, n) in &old.processes {
            let ups: u32 = plan.steps.iter().map(|s| s.expect.remaining(t, JobState::Up)).sum();
            let downs: u32 = plan
                .steps
                .iter()
                .map(|s| s.expect.remaining(t, JobState::Down))
                .sum();
            assert_eq!(ups, *n);
            assert_eq!(downs, *n);
        }

        // Types run in lexicographic order, one type at a time.
        assert_eq!(plan.len(), 12);
        assert_eq!(plan.steps[0].expect.remaining("clock", JobState::Up), 1);
        assert_eq!(plan.steps[2].expect.remaining("web", JobState::Up), 1);
        assert_eq!(plan.steps[8].expect.remaining("worker", JobState::Up), 1);
    }

    #[test]
    fn one_by_one_carries_new_counts_across_types() {
        let old = formation("r1", &[("web", 1), ("worker", 1)]);
        let plan = DeploymentStrategy::OneByOne.plan(&old, &Formation::empty("app", "r2"));

        // Starting the worker keeps the web instance already moved.
        let start_worker = &plan.steps[2];
        assert_eq!(start_worker.formation.count("web"), 1);
        assert_eq!(start_worker.formation.count("worker"), 1);

        let stop_worker = &plan.steps[3];
        assert_eq!(stop_worker.formation.count("web"), 0);
        assert_eq!(stop_worker.formation.count("worker"), 0);
    }

    #[test]
    fn one_by_one_resumes_from_stored_new_formation() {
        // A previous run moved one of two web instances before stopping.
        let old = formation("r1", &[("web", 1)]);
        let new = formation("r2", &[("web", 1)]);
        let plan = DeploymentStrategy::OneByOne.plan(&old, &new);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps[0].formation.count("web"), 2);
        assert_eq!(plan.steps[1].formation.count("web"), 0);
        for totals in capacity_history(&plan, &old, &new) {
            assert!(totals["web"] <= 3);
        }
    }

    #[test]
    fn steps_expect_events_from_the_release_they_write() {
        let old = formation("r1", &[("web", 2)]);
        let new = Formation::empty("app", "r2");
        for strategy in [DeploymentStrategy::OneByOne, DeploymentStrategy::AllAtOnce] {
            for step in strategy.plan(&old, &new).steps {
                assert_eq!(step.expect.release_id(), Some(step.formation.release_id.as_str()));
            }
        }
    }

    #[test]
    fn saturated_new_counts_do_not_overflow() {
        let old = formation("r1", &[("web", 2)]);
        let new = formation("r2", &[("web", u32::MAX - 1)]);

        let plan = DeploymentStrategy::AllAtOnce.plan(&old, &new);
        assert_eq!(plan.steps[0].formation.count("web"), u32::MAX);

        let plan = DeploymentStrategy::OneByOne.plan(&old, &new);
        assert_eq!(plan.steps[0].formation.count("web"), u32::MAX);
        assert_eq!(plan.steps[2].formation.count("web"), u32::MAX);
    }

    #[test]
    fn empty_old_formation_plans_nothing() {
        let old = Formation::empty("app", "r1");
        let new = Formation::empty("app", "r2");
        assert!(DeploymentStrategy::OneByOne.plan(&old, &new).is_empty());
        assert!(DeploymentStrategy::AllAtOnce.plan(&old, &new).is_empty());
    }

    #[test]
    fn all_at_once_starts_everything_then_stops_everything() {
        let old = formation("r1", &[("web", 3), ("worker", 2)]);
        let new = Formation::empty("app", "r2");
        let plan = DeploymentStrategy::AllAtOnce.plan(&old, &new);

        assert_eq!(plan.len(), 2);

        let start = &plan.steps[0];
        assert_eq!(start.formation.release_id, "r2");
        assert_eq!(start.formation.count("web"), 3);
        assert_eq!(start.formation.count("worker"), 2);
        assert_eq!(start.expect.remaining("web", JobState::Up), 3);
        assert_eq!(start.expect.remaining("worker", JobState::Up), 2);

        let stop = &plan.steps[1];
        assert_eq!(stop.formation.release_id, "r1");
        assert_eq!(stop.formation.total(), 0);
        assert_eq!(stop.expect.remaining("web", JobState::Down), 3);
        assert_eq!(stop.expect.remaining("worker", JobState::Down), 2);
    }
}
