//! Fixed-timestep tick loop over view-driven systems.
//!
//! Each system declares interest in exactly one view type. Every tick, for
//! each system in registration order:
//!
//! 1. A [`ViewSnapshot`] of that view type is taken.
//! 2. Unsatisfied views are skipped silently; entities are often still being
//!    assembled.
//! 3. The system runs once per satisfied view with `&mut Core`.
//!
//! A system that fails for one view is logged and the tick moves on to the
//! next view. The loop does not own the [`Core`]; the app that drives it
//! decides whether the tick runs inside a replication session.
//!
//! # Example
//!
//! ```
//! use ember_engine::prelude::*;
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct Position(f32);
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct Velocity(f32);
//!
//! let mut core = Core::default();
//! let p = core.register_component::<Position>("position");
//! let v = core.register_component::<Velocity>("velocity");
//! let moving = core.register_view_type("moving", &[p, v]);
//!
//! let e = core.create_entity().unwrap();
//! core.add_component(e, Position(0.0)).unwrap();
//! core.add_component(e, Velocity(2.0)).unwrap();
//! core.add_view(e, moving).unwrap();
//!
//! fn integrate(core: &mut Core, view: ViewRef, dt: f64) -> Result<(), EcsError> {
//!     let velocity = core.view_component::<Velocity>(view).map_or(0.0, |v| v.0);
//!     let entity = core.view_entity(view).ok_or(EcsError::StaleView { view })?;
//!     core.modify_component::<Position, _>(entity, |p| p.0 += velocity * dt as f32)
//! }
//!
//! let mut tick_loop = TickLoop::new(0.5);
//! tick_loop.add_system("integrate", moving, integrate);
//! tick_loop.run_ticks(&mut core, 2);
//! assert_eq!(core.get_component::<Position>(e).unwrap().0, 2.0);
//! ```

use std::time::{Duration, Instant};

use ember_ecs::core::Core;
use ember_ecs::view::{ViewRef, ViewTypeId};
use ember_ecs::EcsError;
use tracing::warn;

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Per-system measurements for one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemStats {
    pub name: String,
    pub time: Duration,
    /// Satisfied views the system ran on.
    pub visited: usize,
    /// Views skipped because they were unsatisfied.
    pub skipped: usize,
    /// Views for which the system returned an error.
    pub failed: usize,
}

/// Timing diagnostics for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// One entry per system, in execution order.
    pub systems: Vec<SystemStats>,
    /// Wall-clock time for the whole tick.
    pub total_time: Duration,
}

impl TickDiagnostics {
    pub fn stats(&self, name: &str) -> Option<&SystemStats> {
        self.systems.iter().find(|s| s.name == name)
    }
}

// ---------------------------------------------------------------------------
// SystemFn
// ---------------------------------------------------------------------------

/// A system body, called once per satisfied view with the fixed time step.
pub type SystemFn = fn(&mut Core, ViewRef, f64) -> Result<(), EcsError>;

#[derive(Debug)]
struct RegisteredSystem {
    name: String,
    view_type: ViewTypeId,
    func: SystemFn,
    /// Names of systems that must execute before this one.
    after: Vec<String>,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// Runs registered systems over their views at a fixed time step.
pub struct TickLoop {
    systems: Vec<RegisteredSystem>,
    tick_counter: u64,
    fixed_dt: f64,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    /// # Panics
    ///
    /// Panics if `fixed_dt` is not positive and finite.
    pub fn new(fixed_dt: f64) -> Self {
        assert!(
            fixed_dt > 0.0 && fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {fixed_dt}"
        );
        Self {
            systems: Vec::new(),
            tick_counter: 0,
            fixed_dt,
            last_diagnostics: TickDiagnostics::default(),
        }
    }

    /// Register a system over `view_type`.
    ///
    /// Systems execute in registration order.
    ///
    /// # Panics
    ///
    /// Panics if a system with the same name is already registered.
    pub fn add_system(&mut self, name: &str, view_type: ViewTypeId, func: SystemFn) {
        self.add_system_after(name, view_type, &[], func);
    }

    /// Register a system that must run after the named systems.
    ///
    /// # Panics
    ///
    /// Panics if a dependency is not registered yet, the name is taken, or
    /// the dependencies form a cycle.
    pub fn add_system_after(
        &mut self,
        name: &str,
        view_type: ViewTypeId,
        after: &[&str],
        func: SystemFn,
    ) {
        for dep in after {
            assert!(
                self.systems.iter().any(|s| s.name == *dep),
                "system '{name}' declares dependency on '{dep}', but '{dep}' is not registered"
            );
        }
        assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name: {name:?}"
        );

        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            view_type,
            func,
            after: after.iter().map(|s| s.to_string()).collect(),
        });

        self.validate_system_order();
    }

    /// DFS over the `after` edges.
    fn validate_system_order(&self) {
        let mut visited = vec![false; self.systems.len()];
        let mut in_stack = vec![false; self.systems.len()];

        fn dfs(
            systems: &[RegisteredSystem],
            idx: usize,
            visited: &mut [bool],
            in_stack: &mut [bool],
        ) -> bool {
            if in_stack[idx] {
                return false;
            }
            if visited[idx] {
                return true;
            }
            visited[idx] = true;
            in_stack[idx] = true;
            for dep_name in &systems[idx].after {
                if let Some(dep_idx) = systems.iter().position(|s| s.name == *dep_name) {
                    if !dfs(systems, dep_idx, visited, in_stack) {
                        return false;
                    }
                }
            }
            in_stack[idx] = false;
            true
        }

        for i in 0..self.systems.len() {
            assert!(
                dfs(&self.systems, i, &mut visited, &mut in_stack),
                "cycle detected in system dependencies"
            );
        }
    }

    /// Run every system once over its satisfied views.
    pub fn tick(&mut self, core: &mut Core) -> &TickDiagnostics {
        let tick_start = Instant::now();
        let mut systems = Vec::with_capacity(self.systems.len());

        for system in &self.systems {
            let start = Instant::now();
            let mut stats = SystemStats {
                name: system.name.clone(),
                ..SystemStats::default()
            };
            for view in core.get_all_of_type(system.view_type) {
                // Re-checked per view: an earlier call may have changed it.
                if !core.is_satisfied(view) {
                    stats.skipped += 1;
                    continue;
                }
                stats.visited += 1;
                if let Err(e) = (system.func)(core, view, self.fixed_dt) {
                    stats.failed += 1;
                    warn!(system = %system.name, ?view, error = %e, "system failed");
                }
            }
            stats.time = start.elapsed();
            systems.push(stats);
        }

        self.tick_counter += 1;
        self.last_diagnostics = TickDiagnostics {
            systems,
            total_time: tick_start.elapsed(),
        };
        &self.last_diagnostics
    }

    pub fn run_ticks(&mut self, core: &mut Core, count: u64) {
        for _ in 0..count {
            self.tick(core);
        }
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Simulated seconds. Multiplied, not accumulated.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.fixed_dt
    }

    pub fn fixed_dt(&self) -> f64 {
        self.fixed_dt
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
