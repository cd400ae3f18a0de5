use nalgebra::DVector;
use sprs::{CsMat, TriMat};

use crate::circuit::NodeId;

/// Shunt conductance added to every non-ground diagonal entry. Large enough
/// to keep floating subgraphs solvable, negligible next to any realistic
/// conductance.
pub const GMIN: f64 = 1e-12;

/// MNA system representation: [A][x] = [z]
///
/// A is accumulated as (row, col, value) triplets; duplicate coordinates sum
/// additively. Row and column 0 belong to the ground anchor equation V0 = 0,
/// and every stamp helper skips writes into them, so the identity row
/// survives accumulation intact.
#[derive(Debug, Clone)]
pub struct MnaSystem {
    /// Total system size: node count plus auxiliary equations.
    size: usize,
    /// Node count (including ground). Node ids double as matrix indices.
    num_nodes: usize,
    /// Coefficient triplets for A.
    triplets: Vec<(usize, usize, f64)>,
    /// Right-hand side vector z.
    pub z: DVector<f64>,
    /// Solution vector x (node voltages + auxiliary branch currents).
    pub x: DVector<f64>,
    /// Memoized compressed-column form of A.
    compressed: Option<CsMat<f64>>,
    /// Scratch buffer for the residual product A*x.
    residual: Vec<f64>,
}

impl MnaSystem {
    pub fn new(num_nodes: usize, num_extra: usize) -> Self {
        let size = num_nodes + num_extra;
        MnaSystem {
            size,
            num_nodes,
            triplets: Vec::new(),
            z: DVector::zeros(size),
            x: DVector::zeros(size),
            compressed: None,
            residual: vec![0.0; size],
        }
    }

    /// Total system size (nodes + auxiliary equations).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Node count, including ground.
    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    /// Zero z and drop all accumulated coefficients.
    pub fn clear(&mut self) {
        self.triplets.clear();
        self.z.fill(0.0);
    }

    /// Drop the memoized compressed form. Must be called whenever the next
    /// stamp pass may produce different coefficients than the last one.
    pub fn invalidate_compressed(&mut self) {
        self.compressed = None;
    }

    /// Accumulate a coefficient into A, skipping any write whose row or
    /// column is the ground anchor.
    pub fn add(&mut self, row: usize, col: usize, value: f64) {
        if row == 0 || col == 0 {
            return;
        }
        self.triplets.push((row, col, value));
    }

    /// Accumulate into z, skipping the ground row.
    pub fn add_rhs(&mut self, row: usize, value: f64) {
        if row == 0 {
            return;
        }
        self.z[row] += value;
    }

    /// Overwrite a z entry, skipping the ground row. Only valid for rows
    /// owned by a single component (auxiliary source rows).
    pub fn set_rhs(&mut self, row: usize, value: f64) {
        if row == 0 {
            return;
        }
        self.z[row] = value;
    }

    /// Write the identity equation V0 = 0 into row 0.
    pub fn anchor_ground(&mut self) {
        self.triplets.push((0, 0, 1.0));
        self.z[0] = 0.0;
    }

    /// Add the gmin shunt to every non-ground node diagonal.
    pub fn apply_gmin(&mut self) {
        for node in 1..self.num_nodes {
            self.triplets.push((node, node, GMIN));
        }
    }

    /// Stamp a conductance between two nodes:
    ///   A[n1,n1] += G, A[n2,n2] += G, A[n1,n2] -= G, A[n2,n1] -= G
    pub fn stamp_conductance(&mut self, node1: NodeId, node2: NodeId, g: f64) {
        self.add(node1, node1, g);
        self.add(node2, node2, g);
        self.add(node1, node2, -g);
        self.add(node2, node1, -g);
    }

    /// Stamp a current source. Positive current flows from node1 to node2:
    ///   z[n1] -= I, z[n2] += I
    pub fn stamp_current_source(&mut self, node1: NodeId, node2: NodeId, current: f64) {
        self.add_rhs(node1, -current);
        self.add_rhs(node2, current);
    }

    /// Stamp the coupling entries for a voltage constraint row enforcing
    /// V(n1) - V(n2) on auxiliary row `row`, whose unknown is the branch
    /// current flowing n1 -> n2.
    pub fn stamp_voltage_row(&mut self, node1: NodeId, node2: NodeId, row: usize) {
        self.add(node1, row, 1.0);
        self.add(row, node1, 1.0);
        self.add(node2, row, -1.0);
        self.add(row, node2, -1.0);
    }

    /// Compressed-column form of A, built on first use and memoized until
    /// invalidated. Duplicate triplets accumulate additively during
    /// conversion.
    pub fn compressed(&mut self) -> &CsMat<f64> {
        let (size, triplets) = (self.size, &self.triplets);
        self.compressed
            .get_or_insert_with(|| compress(size, triplets))
    }

    /// Infinity norm of the Kirchhoff residual A*x - z, computed against the
    /// compressed form. Bypasses the dense buffer entirely.
    pub fn residual_inf_norm(&mut self) -> f64 {
        let (size, triplets) = (self.size, &self.triplets);
        let compressed = self
            .compressed
            .get_or_insert_with(|| compress(size, triplets));

        self.residual.clear();
        self.residual.resize(size, 0.0);
        for (value, (row, col)) in compressed.iter() {
            self.residual[row] += value * self.x[col];
        }

        let mut norm = 0.0f64;
        for row in 0..size {
            norm = norm.max((self.residual[row] - self.z[row]).abs());
        }
        norm
    }
}

/// Convert accumulated triplets to compressed-column form.
fn compress(size: usize, triplets: &[(usize, usize, f64)]) -> CsMat<f64> {
    let mut builder = TriMat::new((size, size));
    for &(row, col, value) in triplets {
        builder.add_triplet(row, col, value);
    }
    builder.to_csc()
}
