use std::sync::Arc;

use crate::node::PointId;
use crate::{Result, SgTreeError};

/// Immutable, row-contiguous matrix of `len × dim` vectors.
///
/// Rows are addressed by [`PointId`]. The buffer is reference counted so a
/// store can be shared by several trees (and their callers) without copying.
#[derive(Debug, Clone)]
pub struct PointStore {
    data: Arc<[f32]>,
    dim: usize,
    len: usize,
}

impl PointStore {
    /// Wrap a row-major buffer of `data.len() / dim` vectors.
    pub fn from_flat(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(SgTreeError::InvalidShape(
                "dimension must be positive".to_string(),
            ));
        }
        if data.len() % dim != 0 {
            return Err(SgTreeError::InvalidShape(format!(
                "buffer of {} values is not a whole number of {dim}-dimensional rows",
                data.len()
            )));
        }
        if let Some(pos) = data.iter().position(|v| !v.is_finite()) {
            return Err(SgTreeError::InvalidShape(format!(
                "non-finite component in row {}",
                pos / dim
            )));
        }
        let len = data.len() / dim;
        if u32::try_from(len).is_err() {
            return Err(SgTreeError::InvalidShape(format!(
                "{len} rows exceed the point id range"
            )));
        }
        Ok(Self {
            data: data.into(),
            dim,
            len,
        })
    }

    /// Copy a slice of rows into a contiguous store. Every row must share one length.
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let Some(first) = rows.first() else {
            return Ok(Self {
                data: Arc::from(Vec::new()),
                dim: 0,
                len: 0,
            });
        };
        let dim = first.len();
        if let Some(idx) = rows.iter().position(|row| row.len() != dim) {
            return Err(SgTreeError::InvalidShape(format!(
                "row {idx} has {} components, expected {dim}",
                rows[idx].len()
            )));
        }
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            data.extend_from_slice(row);
        }
        Self::from_flat(data, dim)
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check whether the store holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of components per vector.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Borrow the vector of `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range. Trees only hold validated ids.
    #[inline]
    pub fn vector(&self, id: PointId) -> &[f32] {
        let start = id as usize * self.dim;
        &self.data[start..start + self.dim]
    }

    /// Borrow the vector of `id`, or `None` if it is out of range.
    pub fn get(&self, id: PointId) -> Option<&[f32]> {
        if (id as usize) < self.len {
            Some(self.vector(id))
        } else {
            None
        }
    }

    /// Iterate over `(id, vector)` pairs in id order.
    pub fn iter(&self) -> impl Iterator<Item = (PointId, &[f32])> + '_ {
        self.data
            .chunks_exact(self.dim.max(1))
            .take(self.len)
            .enumerate()
            .map(|(idx, row)| (idx as PointId, row))
    }
}
