//! Coarse-to-fine scale schedule.
//!
//! A schedule is the ordered list of token-map resolutions the decoder
//! visits. Everything positional in the model (sequence offsets, level
//! labels, the scale-causal attention bias) is derived from it once at
//! construction.

use candle_core::{DType, Device, Result, Tensor};

use crate::sampling::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSchedule {
    patch_nums: Vec<usize>,
    offsets: Vec<usize>,
    total_len: usize,
}

impl ScaleSchedule {
    /// Build a schedule. Resolutions must be non-empty, non-zero and
    /// strictly increasing.
    pub fn new(patch_nums: &[usize]) -> std::result::Result<Self, ConfigError> {
        if patch_nums.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        if patch_nums[0] == 0 {
            return Err(ConfigError::NonIncreasingSchedule(patch_nums.to_vec()));
        }
        if patch_nums.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ConfigError::NonIncreasingSchedule(patch_nums.to_vec()));
        }

        let mut offsets = Vec::with_capacity(patch_nums.len());
        let mut cursor = 0;
        for &pn in patch_nums {
            offsets.push(cursor);
            cursor += pn * pn;
        }

        Ok(Self {
            patch_nums: patch_nums.to_vec(),
            offsets,
            total_len: cursor,
        })
    }

    pub fn num_scales(&self) -> usize {
        self.patch_nums.len()
    }

    /// Tokens per side at scale `si`.
    pub fn patch_num(&self, si: usize) -> usize {
        self.patch_nums[si]
    }

    /// Tokens at scale `si` (`pn²`).
    pub fn scale_len(&self, si: usize) -> usize {
        self.patch_nums[si] * self.patch_nums[si]
    }

    /// Index of the first token of scale `si` in the flattened sequence.
    pub fn offset(&self, si: usize) -> usize {
        self.offsets[si]
    }

    /// Total sequence length `Σ pn²`.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn first_len(&self) -> usize {
        self.scale_len(0)
    }

    /// Resolution of the final (largest) scale.
    pub fn max_patch_num(&self) -> usize {
        self.patch_nums[self.patch_nums.len() - 1]
    }

    pub fn is_last(&self, si: usize) -> bool {
        si + 1 == self.patch_nums.len()
    }

    /// Normalised position of scale `si` in `[0, 1]`; 0 for a single-scale schedule.
    pub fn progress(&self, si: usize) -> f64 {
        let last = self.patch_nums.len() - 1;
        if last == 0 {
            0.0
        } else {
            si as f64 / last as f64
        }
    }

    /// Per-token scale label, `L` entries.
    pub fn level_labels(&self) -> Vec<u32> {
        self.patch_nums
            .iter()
            .enumerate()
            .flat_map(|(si, &pn)| std::iter::repeat(si as u32).take(pn * pn))
            .collect()
    }

    /// Additive attention bias `[1, 1, L, L]`: 0 where the key's scale is not
    /// later than the query's, `-inf` otherwise. Bidirectional within a scale.
    pub fn attention_bias(&self, dtype: DType, device: &Device) -> Result<Tensor> {
        let labels = self.level_labels();
        let len = self.total_len;
        let bias: Vec<f32> = labels
            .iter()
            .flat_map(|&query| {
                labels.iter().map(move |&key| {
                    if key <= query {
                        0.0
                    } else {
                        f32::NEG_INFINITY
                    }
                })
            })
            .collect();
        Tensor::from_vec(bias, (1, 1, len, len), device)?.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_and_total_len() {
        let schedule = ScaleSchedule::new(&[1, 2, 3, 4, 5, 6, 8, 10, 13, 16]).unwrap();
        assert_eq!(schedule.total_len(), 680);
        assert_eq!(schedule.offset(0), 0);
        assert_eq!(schedule.offset(1), 1);
        assert_eq!(schedule.offset(2), 5);
        assert_eq!(schedule.offset(9), 680 - 256);
        assert_eq!(schedule.first_len(), 1);
        assert_eq!(schedule.max_patch_num(), 16);
    }

    #[test]
    fn small_schedule_len_is_sum_of_squares() {
        let schedule = ScaleSchedule::new(&[1, 2, 3]).unwrap();
        assert_eq!(schedule.total_len(), 1 + 4 + 9);
        let lens: Vec<usize> = (0..3).map(|si| schedule.scale_len(si)).collect();
        assert_eq!(lens, vec![1, 4, 9]);
    }

    #[test]
    fn rejects_bad_schedules() {
        assert!(matches!(
            ScaleSchedule::new(&[]),
            Err(ConfigError::EmptySchedule)
        ));
        assert!(matches!(
            ScaleSchedule::new(&[1, 2, 2]),
            Err(ConfigError::NonIncreasingSchedule(_))
        ));
        assert!(matches!(
            ScaleSchedule::new(&[3, 2]),
            Err(ConfigError::NonIncreasingSchedule(_))
        ));
        assert!(matches!(
            ScaleSchedule::new(&[0, 1]),
            Err(ConfigError::NonIncreasingSchedule(_))
        ));
    }

    #[test]
    fn progress_ramps_from_zero_to_one() {
        let schedule = ScaleSchedule::new(&[1, 2, 4, 8, 16]).unwrap();
        assert_eq!(schedule.progress(0), 0.0);
        assert_eq!(schedule.progress(4), 1.0);
        assert!((schedule.progress(2) - 0.5).abs() < 1e-12);

        let single = ScaleSchedule::new(&[4]).unwrap();
        assert_eq!(single.progress(0), 0.0);
        assert!(single.is_last(0));
    }

    #[test]
    fn level_labels_follow_scales() {
        let schedule = ScaleSchedule::new(&[1, 2]).unwrap();
        assert_eq!(schedule.level_labels(), vec![0, 1, 1, 1, 1]);
    }

    #[test]
    fn attention_bias_is_block_lower_triangular() {
        let schedule = ScaleSchedule::new(&[1, 2]).unwrap();
        let bias = schedule
            .attention_bias(DType::F32, &Device::Cpu)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        // the first-scale token cannot see scale 1
        assert_eq!(bias[0][0], 0.0);
        for key in 1..5 {
            assert_eq!(bias[0][key], f32::NEG_INFINITY);
        }
        // scale-1 tokens see everything, including later tokens of their own scale
        for query in 1..5 {
            for key in 0..5 {
                assert_eq!(bias[query][key], 0.0, "query {query} key {key}");
            }
        }
    }
}
