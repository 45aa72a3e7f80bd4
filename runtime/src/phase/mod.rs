//! Phase management: the monotone collective phase counter, registered
//! phase hooks, and the phase-boundary pipeline (quiesce, end hooks, load
//! balancing, post-migration hooks, advance, start hooks).

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use log::info;

use crate::runtime::Runtime;
use crate::types::Phase;

/// When a registered hook fires relative to the phase boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhaseHook {
    /// After the phase counter advances
    Start,
    /// Before load balancing, while the old phase's work is quiesced
    End,
    /// After load-balancing migrations are enacted
    EndPostMigration,
}

/// Returned by hook registration; needed to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseHookId {
    hook: PhaseHook,
    id: u64,
    collective: bool,
}

type HookFn = Rc<dyn Fn(&mut Runtime)>;

pub struct PhaseManager {
    cur_phase: Phase,
    in_next_phase: bool,
    collective_hooks: BTreeMap<(PhaseHook, u64), HookFn>,
    rooted_hooks: BTreeMap<(PhaseHook, u64), HookFn>,
    next_hook_id: u64,
    phase_started: Instant,
}

impl PhaseManager {
    pub fn new() -> Self {
        Self {
            cur_phase: 0,
            in_next_phase: false,
            collective_hooks: BTreeMap::new(),
            rooted_hooks: BTreeMap::new(),
            next_hook_id: 0,
            phase_started: Instant::now(),
        }
    }

    pub fn cur_phase(&self) -> Phase {
        self.cur_phase
    }

    fn hooks_for(&self, hook: PhaseHook, collective: bool) -> Vec<HookFn> {
        let map = if collective {
            &self.collective_hooks
        } else {
            &self.rooted_hooks
        };
        map.range((hook, 0)..=(hook, u64::MAX))
            .map(|(_, f)| f.clone())
            .collect()
    }
}

impl Default for PhaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn cur_phase(&self) -> Phase {
        self.phases.cur_phase()
    }

    /// Registers a hook on every process; collective hooks run inside a
    /// collective epoch, so registration order and count must match
    /// across processes.
    pub fn register_hook_collective(
        &mut self,
        hook: PhaseHook,
        f: impl Fn(&mut Runtime) + 'static,
    ) -> PhaseHookId {
        let id = self.phases.next_hook_id;
        self.phases.next_hook_id += 1;
        self.phases.collective_hooks.insert((hook, id), Rc::new(f));
        PhaseHookId {
            hook,
            id,
            collective: true,
        }
    }

    /// Registers a process-local hook, run inside a rooted epoch.
    pub fn register_hook_rooted(
        &mut self,
        hook: PhaseHook,
        f: impl Fn(&mut Runtime) + 'static,
    ) -> PhaseHookId {
        let id = self.phases.next_hook_id;
        self.phases.next_hook_id += 1;
        self.phases.rooted_hooks.insert((hook, id), Rc::new(f));
        PhaseHookId {
            hook,
            id,
            collective: false,
        }
    }

    /// Removes a hook.
    ///
    /// # Panics
    ///
    /// Panics when called from inside `next_phase_collective`, or when the
    /// hook was never registered.
    pub fn unregister_hook(&mut self, hook_id: PhaseHookId) {
        assert!(
            !self.phases.in_next_phase,
            "must not be inside next_phase_collective to unregister a hook"
        );
        let map = if hook_id.collective {
            &mut self.phases.collective_hooks
        } else {
            &mut self.phases.rooted_hooks
        };
        if map.remove(&(hook_id.hook, hook_id.id)).is_none() {
            panic!("could not find registered hook to erase");
        }
    }

    fn run_phase_hooks(&mut self, hook: PhaseHook) {
        for f in self.phases.hooks_for(hook, false) {
            self.run_in_epoch_rooted("phase-hook", move |rt| f(rt));
        }
        for f in self.phases.hooks_for(hook, true) {
            self.run_in_epoch_collective("phase-hook", move |rt| f(rt));
        }
    }

    /// Collective phase advance: quiesce, end hooks, load balancing,
    /// post-migration hooks, counter bump, start hooks. Re-entry is a
    /// contract violation.
    pub fn next_phase_collective(&mut self) {
        assert!(
            !self.phases.in_next_phase,
            "a call to next_phase_collective has already been invoked; \
             it must return before it is invoked again"
        );
        self.phases.in_next_phase = true;
        let phase = self.phases.cur_phase;

        // every process has arrived and prior work has drained
        self.system_barrier();

        self.run_phase_hooks(PhaseHook::End);
        self.lb_run(phase);
        self.run_phase_hooks(PhaseHook::EndPostMigration);

        self.stats.emit_phase_records(phase);
        self.stats.release_stats_from_unneeded_phases(phase, 8);

        self.phases.cur_phase += 1;
        self.run_phase_hooks(PhaseHook::Start);

        self.print_phase_summary(phase);

        // every process has observed the new phase
        self.system_barrier();
        self.phases.phase_started = Instant::now();
        self.phases.in_next_phase = false;
    }

    fn print_phase_summary(&mut self, phase: Phase) {
        if self.node().0 != 0 {
            return;
        }
        let duration = self.phases.phase_started.elapsed().as_secs_f64();
        let info = self.lb.last_phase_info;
        info!(
            "phase={phase}, duration={duration:.6}s, rank_max_compute_time={:.6}s, \
             rank_avg_compute_time={:.6}s, imbalance={:.3}, grain_max_time={:.6}s, \
             migration count={}",
            info.max_load, info.avg_load, info.imb_load, info.max_obj, info.migration_count
        );
        if !info.ran_lb {
            if info.avg_load > 0.0 && info.max_load > info.avg_load {
                let speedup = info.max_load / info.avg_load;
                let improvement = (info.max_load - info.avg_load) / info.max_load * 100.0;
                info!(
                    "ideal load balance would run {speedup:.2}x faster \
                     (or take {improvement:.2}% less time)"
                );
            }
        } else if info.migration_count > 0 && info.avg_load_post_lb > 0.0 {
            let speedup = info.max_load_post_lb / info.avg_load_post_lb;
            let improvement =
                (info.max_load_post_lb - info.avg_load_post_lb) / info.max_load_post_lb * 100.0;
            info!(
                "after load balancing, expected execution should get a {speedup:.2}x \
                 speedup (or take {improvement:.2}% less time)"
            );
        }
        if info.max_obj > info.avg_load && info.max_obj > 0.0 {
            let speedup = info.max_load / info.max_obj;
            info!(
                "largest grain object limits load balancing improvement to a \
                 {speedup:.2}x speedup"
            );
        }
    }

    /// Sets the statistics subphase for subsequent handler brackets.
    pub fn set_subphase(&mut self, subphase: crate::types::SubPhase) {
        self.stats.set_subphase(subphase);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hooks_are_kept_in_registration_order() {
        let mut phases = PhaseManager::new();
        phases
            .collective_hooks
            .insert((PhaseHook::End, 0), Rc::new(|_: &mut Runtime| {}));
        phases
            .collective_hooks
            .insert((PhaseHook::End, 2), Rc::new(|_: &mut Runtime| {}));
        phases
            .collective_hooks
            .insert((PhaseHook::Start, 1), Rc::new(|_: &mut Runtime| {}));
        assert_eq!(phases.hooks_for(PhaseHook::End, true).len(), 2);
        assert_eq!(phases.hooks_for(PhaseHook::Start, true).len(), 1);
        assert_eq!(phases.hooks_for(PhaseHook::EndPostMigration, true).len(), 0);
    }
}
