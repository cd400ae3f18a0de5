use log::{debug, trace, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::components::Component;
use crate::error::{Error, Result};
use crate::mna::MnaSystem;
use crate::solver::LinearSolver;

/// Dense node identifier, assigned at creation. Doubles as the node's
/// matrix row/column index.
pub type NodeId = usize;

/// The ground node, injected at circuit construction.
pub const GROUND: NodeId = 0;

/// A node in the circuit. Voltage is written by the engine after every
/// solve and is read-only to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    voltage: f64,
}

impl Node {
    fn new(id: NodeId) -> Self {
        Node { id, voltage: 0.0 }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn voltage(&self) -> f64 {
        self.voltage
    }

    pub fn is_ground(&self) -> bool {
        self.id == GROUND
    }
}

/// A circuit and its MNA solve engine.
///
/// Nodes and components are append-only; adding either marks the circuit
/// dirty so the next solve rebuilds the system layout. A single `solve` is
/// the atomic unit of work: node voltages are republished once per Newton
/// iteration, so observers must read only after `solve` returns.
pub struct Circuit {
    nodes: Vec<Node>,
    components: Vec<Component>,
    system: MnaSystem,
    solver: LinearSolver,
    /// Previous Newton iterate, for the step-norm test.
    x_prev: DVector<f64>,
    dirty: bool,
    /// Bumped on every system build; part of the fast-path key.
    stamp_version: u64,
    /// Aggregate of the components' iteration flags.
    requires_iteration: bool,
    /// Aggregate of the components' restamp flags.
    requires_restamp: bool,
    /// (dt, stamp version) of the last successful solve.
    last_solve: Option<(f64, u64)>,
    last_iterations: usize,
    /// Scale factor for the dual convergence test.
    pub convergence_tolerance: f64,
    /// Newton iteration cap for circuits that require iteration.
    pub max_iterations: usize,
}

impl Circuit {
    pub fn new() -> Self {
        Circuit {
            nodes: vec![Node::new(GROUND)],
            components: Vec::new(),
            system: MnaSystem::new(1, 0),
            solver: LinearSolver::new(),
            x_prev: DVector::zeros(1),
            dirty: true,
            stamp_version: 0,
            requires_iteration: false,
            requires_restamp: false,
            last_solve: None,
            last_iterations: 0,
            convergence_tolerance: 1e-6,
            max_iterations: 50,
        }
    }

    /// Append a node and return its id.
    pub fn add_node(&mut self) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(id));
        self.dirty = true;
        id
    }

    /// Append a component and return its index. Marks the circuit dirty so
    /// the next solve rebuilds the system layout.
    pub fn add_component(&mut self, component: impl Into<Component>) -> usize {
        let component = component.into();
        self.requires_iteration |= component.requires_iteration();
        self.requires_restamp |= component.requires_restamp();
        self.components.push(component);
        self.dirty = true;
        self.components.len() - 1
    }

    pub fn ground(&self) -> &Node {
        &self.nodes[GROUND]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Mutable access to a component's public parameters between solves.
    /// Parameter changes take effect through per-step restamping without a
    /// rebuild; structural changes still require adding components.
    pub fn component_mut(&mut self, index: usize) -> Option<&mut Component> {
        self.components.get_mut(index)
    }

    /// Voltage at a node from the last solve.
    pub fn voltage(&self, node: NodeId) -> f64 {
        self.nodes[node].voltage
    }

    /// The auxiliary branch current of a voltage source or transformer, for
    /// power accounting. `None` for components without an auxiliary
    /// unknown.
    pub fn branch_current(&self, index: usize) -> Option<f64> {
        let row = self.components.get(index)?.matrix_index()?;
        Some(self.system.x[row])
    }

    /// Newton iterations spent by the last solve; 0 when the fast path hit.
    pub fn last_iterations(&self) -> usize {
        self.last_iterations
    }

    /// Assign contiguous auxiliary indices, size the system, run an initial
    /// stamp pass, and recompute the aggregate flags.
    pub fn build_system(&mut self) {
        let num_nodes = self.nodes.len();
        let mut next = num_nodes;
        for component in &mut self.components {
            if component.has_extra_equation() {
                component.set_matrix_index(next);
                next += 1;
            }
        }
        let num_extra = next - num_nodes;

        self.system = MnaSystem::new(num_nodes, num_extra);
        self.solver.invalidate();
        self.x_prev = DVector::zeros(num_nodes + num_extra);
        self.requires_iteration = self.components.iter().any(|c| c.requires_iteration());
        self.requires_restamp = self.components.iter().any(|c| c.requires_restamp());

        self.assemble(0.0);
        self.dirty = false;
        self.stamp_version += 1;
        self.last_solve = None;

        debug!(
            "built system: {} nodes, {} auxiliary equations, iterative={}, restamp={}",
            num_nodes, num_extra, self.requires_iteration, self.requires_restamp
        );
    }

    /// One full stamp pass: clear, anchor ground, apply gmin, stamp every
    /// component in insertion order.
    fn assemble(&mut self, dt: f64) {
        self.system.clear();
        if self.requires_iteration || self.requires_restamp {
            self.system.invalidate_compressed();
            self.solver.invalidate();
        }
        self.system.anchor_ground();
        self.system.apply_gmin();
        for component in &self.components {
            component.stamp(&mut self.system, dt);
        }
    }

    fn publish_voltages(&mut self) {
        for node in &mut self.nodes {
            node.voltage = self.system.x[node.id];
        }
    }

    /// Solve the circuit for one step.
    ///
    /// `dt` is in seconds and non-negative; `dt = 0` selects DC semantics
    /// per device (capacitors open, inductors near-short). On success node
    /// voltages hold the solution and transient history has advanced; on
    /// error the history is untouched and node voltages reflect the last
    /// iteration that produced a solution.
    pub fn solve(&mut self, dt: f64) -> Result<()> {
        if self.dirty {
            self.build_system();
        }

        // Static fast path: a purely linear circuit whose stamps cannot
        // have changed since the last solve republishes the cached
        // solution.
        if !self.requires_iteration
            && !self.requires_restamp
            && self.last_solve == Some((dt, self.stamp_version))
        {
            self.publish_voltages();
            self.last_iterations = 0;
            trace!("static fast path: republished cached solution");
            return Ok(());
        }

        let tolerance = self.convergence_tolerance;
        let cacheable = !self.requires_iteration && !self.requires_restamp;
        let max_iterations = if self.requires_iteration {
            self.max_iterations
        } else {
            1
        };

        let mut step_norm = f64::INFINITY;
        let mut residual_norm = f64::INFINITY;
        let mut accepted = false;

        for iteration in 0..max_iterations {
            self.assemble(dt);
            self.solver.solve(&mut self.system, cacheable)?;
            self.publish_voltages();

            for component in &mut self.components {
                component.update_operating_point(&self.system.x);
            }

            if !self.requires_iteration {
                self.last_iterations = iteration + 1;
                accepted = true;
                break;
            }

            // The residual is checked against the compressed form of the
            // current iteration, so the first pass is never accepted.
            if iteration > 0 {
                step_norm = inf_norm_diff(&self.system.x, &self.x_prev);
                residual_norm = self.system.residual_inf_norm();
                let step_scale = 1.0 + self.system.x.amax();
                let residual_scale = 1.0 + self.system.z.amax();
                trace!(
                    "iteration {iteration}: step={step_norm:.3e}, residual={residual_norm:.3e}"
                );
                if step_norm < tolerance * step_scale
                    && residual_norm < tolerance * residual_scale
                {
                    self.last_iterations = iteration + 1;
                    accepted = true;
                    break;
                }
            }

            self.x_prev.copy_from(&self.system.x);
        }

        if !accepted {
            self.last_iterations = max_iterations;
            warn!(
                "no convergence after {max_iterations} iterations \
                 (step={step_norm:.3e}, residual={residual_norm:.3e})"
            );
            return Err(Error::NonConvergence {
                iterations: max_iterations,
                step_norm,
                residual_norm,
            });
        }

        // Transient history advances only on acceptance.
        for component in &mut self.components {
            component.update_state(&self.system.x, dt);
        }
        self.last_solve = Some((dt, self.stamp_version));
        debug!(
            "solve(dt={dt:e}) converged in {} iteration(s)",
            self.last_iterations
        );
        Ok(())
    }
}

impl Default for Circuit {
    fn default() -> Self {
        Self::new()
    }
}

fn inf_norm_diff(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}
