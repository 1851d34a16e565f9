use candle_core::{Result, Tensor};

/// Keys and values one attention block has seen during a generation call.
///
/// Stored as `[batch, heads, seq, head_dim]`; new entries are appended along
/// the sequence axis.
#[derive(Debug, Default, Clone)]
pub struct KvCache {
    k: Option<Tensor>,
    v: Option<Tensor>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `k`/`v` and return the full history including them.
    pub fn append(&mut self, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        let (k_full, v_full) = match (&self.k, &self.v) {
            (Some(k_prev), Some(v_prev)) => (
                Tensor::cat(&[k_prev, k], 2)?,
                Tensor::cat(&[v_prev, v], 2)?,
            ),
            _ => (k.clone(), v.clone()),
        };
        self.k = Some(k_full.clone());
        self.v = Some(v_full.clone());
        Ok((k_full, v_full))
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.k
            .as_ref()
            .and_then(|k| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_none()
    }

    pub fn reset(&mut self) {
        self.k = None;
        self.v = None;
    }
}

/// One [`KvCache`] per transformer block, owned by a single generation call.
#[derive(Debug, Clone)]
pub struct GenerationCache {
    layers: Vec<KvCache>,
}

impl GenerationCache {
    pub fn new(depth: usize) -> Self {
        Self {
            layers: vec![KvCache::new(); depth],
        }
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    pub fn layers_mut(&mut self) -> std::slice::IterMut<'_, KvCache> {
        self.layers.iter_mut()
    }

    /// Cached positions, or `None` if the blocks disagree.
    pub fn seq_len(&self) -> Option<usize> {
        let first = self.layers.first().map(KvCache::seq_len).unwrap_or(0);
        self.layers
            .iter()
            .all(|layer| layer.seq_len() == first)
            .then_some(first)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(KvCache::is_empty)
    }

    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.reset();
        }
    }
}
