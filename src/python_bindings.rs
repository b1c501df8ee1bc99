//! Python bindings for the SG tree using PyO3
#![allow(non_local_definitions)]

use std::sync::Arc;

use numpy::{PyArray1, PyArray2, PyReadonlyArray2};
use pyo3::exceptions::{PyIOError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::config::{BuildParams, QueryParams, DEFAULT_BASE};
use crate::metric::Euclidean;
use crate::store::PointStore;
use crate::tree::SgTree;
use crate::SgTreeError;

fn to_py_err(err: SgTreeError) -> PyErr {
    match err {
        SgTreeError::Io(e) => PyIOError::new_err(e.to_string()),
        SgTreeError::Cancelled | SgTreeError::ThreadPool(_) => {
            PyRuntimeError::new_err(err.to_string())
        }
        other => PyValueError::new_err(other.to_string()),
    }
}

fn store_from_array(array: PyReadonlyArray2<f32>) -> PyResult<PointStore> {
    let array = array.as_array();
    let (_, dim) = array.dim();
    let flat: Vec<f32> = array.iter().copied().collect();
    PointStore::from_flat(flat, dim).map_err(to_py_err)
}

fn worker_count(use_multi_core: i64) -> usize {
    if use_multi_core > 0 {
        use_multi_core as usize
    } else {
        BuildParams::default().parallelism
    }
}

#[pyclass(name = "SGTree")]
pub struct PySgTree {
    tree: SgTree<Euclidean>,
}

#[pymethods]
impl PySgTree {
    /// Build a tree over an N x D float32 matrix
    #[staticmethod]
    #[pyo3(signature = (points, use_multi_core=-1, new_base=DEFAULT_BASE))]
    fn from_matrix(
        py: Python,
        points: PyReadonlyArray2<f32>,
        use_multi_core: i64,
        new_base: f64,
    ) -> PyResult<Self> {
        let store = Arc::new(store_from_array(points)?);
        let params = BuildParams::new(new_base, worker_count(use_multi_core));
        let tree = py
            .allow_threads(|| SgTree::build(store, Euclidean, &params))
            .map_err(to_py_err)?;
        Ok(Self { tree })
    }

    /// Exact k nearest neighbours of every query row
    /// Returns (ids, distances), both of shape (Q, k)
    #[pyo3(name = "NearestNeighbour", signature = (queries, use_multi_core=-1, k=1, filename=None))]
    fn nearest_neighbour(
        &self,
        py: Python,
        queries: PyReadonlyArray2<f32>,
        use_multi_core: i64,
        k: usize,
        filename: Option<&str>,
    ) -> PyResult<(Py<PyArray2<i64>>, Py<PyArray2<f32>>)> {
        let queries = store_from_array(queries)?;
        let params = QueryParams::new(k, worker_count(use_multi_core));
        let results = py
            .allow_threads(|| match filename {
                Some(path) => self.tree.nearest_batch_to_trace_file(&queries, &params, path),
                None => self.tree.nearest_batch(&queries, &params),
            })
            .map_err(to_py_err)?;

        let rows = results.len();
        let mut ids = Vec::with_capacity(rows * k);
        let mut distances = Vec::with_capacity(rows * k);
        for hit in &results {
            ids.extend(hit.ids.iter().map(|&id| i64::from(id)));
            distances.extend_from_slice(&hit.distances);
        }

        let ids = PyArray1::<i64>::from_vec(py, ids).reshape([rows, k])?;
        let distances = PyArray1::<f32>::from_vec(py, distances).reshape([rows, k])?;
        Ok((ids.to_owned(), distances.to_owned()))
    }

    /// Write the node table as a JSON document
    fn dump_tree(&self, path: &str) -> PyResult<()> {
        self.tree.dump_json_to_path(path).map_err(to_py_err)
    }

    /// Save the tree in the binary format
    fn save(&self, path: &str) -> PyResult<()> {
        self.tree.save_to_path(path).map_err(to_py_err)
    }

    /// Load a binary tree over the matrix it was built from
    #[staticmethod]
    fn load(path: &str, points: PyReadonlyArray2<f32>) -> PyResult<Self> {
        let store = Arc::new(store_from_array(points)?);
        let tree = SgTree::load_from_path(path, store, Euclidean).map_err(to_py_err)?;
        Ok(Self { tree })
    }

    /// Load a JSON document over the matrix it was built from
    #[staticmethod]
    fn load_tree(path: &str, points: PyReadonlyArray2<f32>) -> PyResult<Self> {
        let store = Arc::new(store_from_array(points)?);
        let tree = SgTree::load_json_from_path(path, store, Euclidean).map_err(to_py_err)?;
        Ok(Self { tree })
    }

    /// Up to `num_best` spread-out point ids, top of the tree first
    #[pyo3(name = "getBestInitialPoints")]
    fn best_initial_points(&self, num_best: usize) -> Vec<u32> {
        self.tree.spread_points(num_best)
    }

    /// Check covering and separation
    fn check_covering(&self) -> bool {
        self.tree.check_invariants().is_ok()
    }

    /// Tree statistics as a JSON string
    fn stats(&self) -> PyResult<String> {
        serde_json::to_string(&self.tree.stats())
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    fn __len__(&self) -> usize {
        self.tree.len()
    }

    fn __repr__(&self) -> String {
        format!(
            "SGTree(points={}, dim={}, base={}, nodes={})",
            self.tree.len(),
            self.tree.dim(),
            self.tree.base(),
            self.tree.node_count()
        )
    }
}

/// Python module initialization
#[pymodule]
fn sgtree_rs(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PySgTree>()?;
    Ok(())
}
