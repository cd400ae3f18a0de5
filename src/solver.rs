use faer::prelude::*;
use faer::sparse::linalg::solvers::Lu as SparseLu;
use faer::sparse::SparseColMat;
use log::trace;

use crate::error::{Error, Result};
use crate::mna::MnaSystem;

/// Systems at or below this size always take the dense path.
const DENSE_SIZE_LIMIT: usize = 96;
/// Systems at or above this fill ratio take the dense path regardless of
/// size; sparse bookkeeping stops paying off.
const DENSE_DENSITY_LIMIT: f64 = 0.18;
/// Dense pivots below this magnitude are treated as singular.
const PIVOT_FLOOR: f64 = 1e-15;

/// Direct solver for the assembled MNA system, with a density-adaptive
/// dense/sparse strategy. The dense buffers are reused across solves of the
/// same size; the sparse factorization is cached while the circuit is
/// static linear.
pub struct LinearSolver {
    /// Row-major LU workspace for the dense path.
    lu: Vec<f64>,
    /// Row permutation for the dense path.
    pivots: Vec<usize>,
    /// Cached sparse factorization, valid until invalidated.
    cached: Option<SparseLu<usize, f64>>,
}

impl LinearSolver {
    pub fn new() -> Self {
        LinearSolver {
            lu: Vec::new(),
            pivots: Vec::new(),
            cached: None,
        }
    }

    /// Drop the cached sparse factorization.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Solve A x = z in place on the system, choosing the dense or sparse
    /// path from the compressed matrix's size and fill.
    pub fn solve(&mut self, system: &mut MnaSystem, cache_factorization: bool) -> Result<()> {
        let n = system.size();
        let nnz = system.compressed().nnz();
        let density = nnz as f64 / (n * n) as f64;

        if n <= DENSE_SIZE_LIMIT || density >= DENSE_DENSITY_LIMIT {
            trace!("dense solve: n={n}, nnz={nnz}");
            self.solve_dense(system)
        } else {
            trace!("sparse solve: n={n}, nnz={nnz}");
            self.solve_sparse(system, cache_factorization)
        }
    }

    fn solve_dense(&mut self, system: &mut MnaSystem) -> Result<()> {
        let n = system.size();
        if self.lu.len() != n * n {
            self.lu = vec![0.0; n * n];
            self.pivots = vec![0; n];
        }

        self.lu.fill(0.0);
        for (value, (row, col)) in system.compressed().iter() {
            self.lu[row * n + col] = *value;
        }

        self.factor(n)?;

        // Apply the row permutation to z.
        for i in 0..n {
            system.x[i] = system.z[self.pivots[i]];
        }

        // Forward substitution: L y = P z.
        for i in 0..n {
            for j in 0..i {
                system.x[i] -= self.lu[i * n + j] * system.x[j];
            }
        }

        // Back substitution: U x = y.
        for i in (0..n).rev() {
            for j in (i + 1)..n {
                system.x[i] -= self.lu[i * n + j] * system.x[j];
            }
            system.x[i] /= self.lu[i * n + i];
        }

        Ok(())
    }

    /// In-place Doolittle LU with partial row pivoting.
    fn factor(&mut self, n: usize) -> Result<()> {
        for i in 0..n {
            self.pivots[i] = i;
        }

        for k in 0..n {
            let mut max_val = self.lu[k * n + k].abs();
            let mut max_row = k;
            for i in (k + 1)..n {
                let val = self.lu[i * n + k].abs();
                if val > max_val {
                    max_val = val;
                    max_row = i;
                }
            }

            if max_val < PIVOT_FLOOR {
                return Err(Error::SingularMatrix { size: n });
            }

            if max_row != k {
                self.pivots.swap(k, max_row);
                for j in 0..n {
                    self.lu.swap(k * n + j, max_row * n + j);
                }
            }

            let pivot = self.lu[k * n + k];
            for i in (k + 1)..n {
                let factor = self.lu[i * n + k] / pivot;
                self.lu[i * n + k] = factor;
                for j in (k + 1)..n {
                    self.lu[i * n + j] -= factor * self.lu[k * n + j];
                }
            }
        }

        Ok(())
    }

    fn solve_sparse(&mut self, system: &mut MnaSystem, cache_factorization: bool) -> Result<()> {
        let n = system.size();

        let lu = match self.cached.take() {
            Some(lu) => {
                trace!("reusing cached sparse factorization");
                lu
            }
            None => {
                let compressed = system.compressed();
                let mut triplets = Vec::with_capacity(compressed.nnz());
                for (value, (row, col)) in compressed.iter() {
                    triplets.push((row, col, *value));
                }
                let matrix = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
                    .map_err(|_| Error::SingularMatrix { size: n })?;
                matrix
                    .sp_lu()
                    .map_err(|_| Error::SingularMatrix { size: n })?
            }
        };

        let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| system.z[i]);
        let solution = lu.solve(rhs);
        for i in 0..n {
            let xi = solution[(i, 0)];
            if !xi.is_finite() {
                return Err(Error::SingularMatrix { size: n });
            }
            system.x[i] = xi;
        }

        if cache_factorization {
            self.cached = Some(lu);
        }

        Ok(())
    }
}

impl Default for LinearSolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Route solver log output through `RUST_LOG` during tests.
    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Anchored system with the given equations in rows 1.. of the node
    /// block.
    fn anchored(entries: &[(usize, usize, f64)], rhs: &[(usize, f64)], num_nodes: usize) -> MnaSystem {
        let mut sys = MnaSystem::new(num_nodes, 0);
        sys.anchor_ground();
        for &(row, col, value) in entries {
            sys.add(row, col, value);
        }
        for &(row, value) in rhs {
            sys.set_rhs(row, value);
        }
        sys
    }

    #[test]
    fn test_dense_lu_solves_known_system() {
        init();
        // [2 1; 1 2] [x; y] = [3; 3] has solution [1; 1].
        let mut sys = anchored(
            &[(1, 1, 2.0), (1, 2, 1.0), (2, 1, 1.0), (2, 2, 2.0)],
            &[(1, 3.0), (2, 3.0)],
            3,
        );
        let mut solver = LinearSolver::new();
        solver.solve(&mut sys, false).unwrap();

        assert_eq!(sys.x[0], 0.0);
        assert!((sys.x[1] - 1.0).abs() < 1e-12);
        assert!((sys.x[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dense_lu_requires_pivoting() {
        init();
        // Zero diagonal forces a row swap.
        let mut sys = anchored(
            &[(1, 2, 1.0), (2, 1, 1.0), (2, 2, 1.0)],
            &[(1, 2.0), (2, 3.0)],
            3,
        );
        let mut solver = LinearSolver::new();
        solver.solve(&mut sys, false).unwrap();

        assert!((sys.x[1] - 1.0).abs() < 1e-12);
        assert!((sys.x[2] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_dense_lu_reports_singular() {
        init();
        let mut sys = anchored(&[(1, 1, 1.0), (2, 1, 1.0)], &[(1, 1.0)], 3);
        let mut solver = LinearSolver::new();
        let err = solver.solve(&mut sys, false).unwrap_err();
        assert!(matches!(err, Error::SingularMatrix { size: 3 }));
    }

    #[test]
    fn test_sparse_path_solves_large_tridiagonal() {
        init();
        // Large enough to cross the dense size limit, sparse enough to stay
        // under the density limit.
        let n = 200;
        let mut sys = MnaSystem::new(n, 0);
        sys.anchor_ground();
        for i in 1..n {
            sys.add(i, i, 2.0);
            if i > 1 {
                sys.add(i, i - 1, -1.0);
                sys.add(i - 1, i, -1.0);
            }
            sys.set_rhs(i, 1.0);
        }

        let mut solver = LinearSolver::new();
        solver.solve(&mut sys, false).unwrap();

        // Verify against the assembled matrix rather than a closed form.
        sys.invalidate_compressed();
        assert!(sys.residual_inf_norm() < 1e-9);
    }

    #[test]
    fn test_cached_factorization_reused_for_new_rhs() {
        init();
        let n = 200;
        let mut sys = MnaSystem::new(n, 0);
        sys.anchor_ground();
        for i in 1..n {
            sys.add(i, i, 4.0);
            if i > 1 {
                sys.add(i, i - 1, -1.0);
                sys.add(i - 1, i, -1.0);
            }
            sys.set_rhs(i, 1.0);
        }

        let mut solver = LinearSolver::new();
        solver.solve(&mut sys, true).unwrap();
        let first = sys.x.clone();

        // Same matrix, doubled RHS: the cached factorization must produce
        // the scaled solution.
        for i in 1..n {
            sys.set_rhs(i, 2.0);
        }
        solver.solve(&mut sys, true).unwrap();

        for i in 0..n {
            assert!((sys.x[i] - 2.0 * first[i]).abs() < 1e-9);
        }
    }
}
