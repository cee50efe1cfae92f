//! Exact flat L2 index.
//!
//! Rows are stored contiguously and searched by brute force, so results are
//! exact and row `i` always refers to the `i`-th vector ever added. Linear in
//! the number of rows; intended for per-namespace collections, not corpora.

use crate::error::{RecallError, RecallResult};

const MAGIC: &[u8; 4] = b"RCIX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// Squared Euclidean distance.
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Distance → similarity in `(0, 1]`; zero distance maps to 1.
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Append-only, exact nearest-neighbor index over fixed-dimension vectors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatIndex {
    dim: Option<usize>,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index with a dimension fixed up front.
    pub fn with_dim(dim: usize) -> Self {
        Self {
            dim: Some(dim),
            data: Vec::new(),
        }
    }

    /// Dimension, or `None` before the first row is added.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    pub fn len(&self) -> usize {
        match self.dim {
            Some(d) if d > 0 => self.data.len() / d,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that every vector matches the index dimension (or each other,
    /// for an empty index) without mutating anything.
    pub fn validate(&self, vectors: &[Vec<f32>]) -> RecallResult<()> {
        let expected = match self.dim.or_else(|| vectors.first().map(Vec::len)) {
            Some(d) => d,
            None => return Ok(()),
        };
        if expected == 0 {
            return Err(RecallError::DimensionMismatch {
                expected: 1,
                actual: 0,
            });
        }
        for v in vectors {
            if v.len() != expected {
                return Err(RecallError::DimensionMismatch {
                    expected,
                    actual: v.len(),
                });
            }
        }
        Ok(())
    }

    /// Append rows in order. All-or-nothing: a dimension mismatch leaves the
    /// index unchanged.
    pub fn add(&mut self, vectors: &[Vec<f32>]) -> RecallResult<()> {
        self.validate(vectors)?;
        if let Some(first) = vectors.first() {
            self.dim.get_or_insert(first.len());
        }
        self.data.reserve(vectors.iter().map(Vec::len).sum());
        for v in vectors {
            self.data.extend_from_slice(v);
        }
        Ok(())
    }

    /// Drop rows beyond `len`. Used to roll back a failed append.
    pub fn truncate(&mut self, len: usize) {
        if let Some(d) = self.dim {
            self.data.truncate(len * d);
        }
    }

    pub fn row(&self, i: usize) -> Option<&[f32]> {
        let d = self.dim?;
        self.data.get(i * d..(i + 1) * d)
    }

    /// The `k` nearest rows as `(row, squared distance)`, nearest first.
    /// Ties go to the lower row number; NaN distances sort last.
    pub fn search(&self, query: &[f32], k: usize) -> RecallResult<Vec<(usize, f32)>> {
        let Some(d) = self.dim else {
            return Ok(Vec::new());
        };
        if query.len() != d {
            return Err(RecallError::DimensionMismatch {
                expected: d,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(d)
            .enumerate()
            .map(|(i, row)| (i, l2_squared(query, row)))
            .collect();

        scored.sort_by(|a, b| {
            a.1.is_nan()
                .cmp(&b.1.is_nan())
                .then(a.1.total_cmp(&b.1))
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Binary encoding: magic, version, dim, row count, then little-endian rows.
    pub fn to_bytes(&self) -> Vec<u8> {
        let rows = self.len() as u64;
        let dim = self.dim.unwrap_or(0) as u32;
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&dim.to_le_bytes());
        out.extend_from_slice(&rows.to_le_bytes());
        for x in &self.data {
            out.extend_from_slice(&x.to_le_bytes());
        }
        out
    }

    /// Decode [`to_bytes`](Self::to_bytes) output. The error string explains
    /// what is wrong; callers wrap it with the namespace.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_LEN {
            return Err(format!("index file too short ({} bytes)", bytes.len()));
        }
        if &bytes[0..4] != MAGIC {
            return Err("bad index magic".into());
        }
        let version = read_u32(&bytes[4..8]);
        if version != FORMAT_VERSION {
            return Err(format!("unsupported index version {version}"));
        }
        let dim = read_u32(&bytes[8..12]) as usize;
        let rows = u64::from_le_bytes([
            bytes[12], bytes[13], bytes[14], bytes[15], bytes[16], bytes[17], bytes[18], bytes[19],
        ]) as usize;

        let body = &bytes[HEADER_LEN..];
        let expected = rows
            .checked_mul(dim)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| "index header overflows".to_string())?;
        if body.len() != expected {
            return Err(format!(
                "index body has {} bytes, header implies {expected}",
                body.len()
            ));
        }
        if dim == 0 && rows > 0 {
            return Err("index has rows but zero dimension".into());
        }

        let data = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            dim: (dim > 0).then_some(dim),
            data,
        })
    }
}

fn read_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
