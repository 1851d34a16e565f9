//! Conditioning mixer.
//!
//! Turns `B` external text embeddings into the `2B` guidance batch (true
//! conditions first, then the learned null condition repeated `B` times)
//! and provides the per-scale position + level embeddings added to every
//! token map.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Embedding, Init, Linear, VarBuilder};

use crate::schedule::ScaleSchedule;

pub struct ConditioningMixer {
    /// Learned null condition, `[1, n_cond]`.
    noise: Tensor,
    cond_proj: Linear,
    /// `[1, first_len, C]`, added only to the first token map.
    pos_start: Tensor,
    /// `lvl_embed[label] + pos_1LC`, `[1, L, C]`.
    lvl_pos: Tensor,
    n_cond_embed: usize,
}

impl ConditioningMixer {
    pub fn new(
        n_cond_embed: usize,
        embed_dim: usize,
        schedule: &ScaleSchedule,
        vb: VarBuilder,
    ) -> Result<Self> {
        let init_std = (1.0 / embed_dim as f64 / 3.0).sqrt();
        let trunc_normal = Init::Randn {
            mean: 0.0,
            stdev: init_std,
        };

        let noise = vb
            .pp("noise")
            .get_with_hints((1, n_cond_embed), "weight", trunc_normal)?;
        let cond_proj = linear(n_cond_embed, embed_dim, vb.pp("cond_proj"))?;
        let pos_start =
            vb.get_with_hints((1, schedule.first_len(), embed_dim), "pos_start", trunc_normal)?;
        let pos_1lc =
            vb.get_with_hints((1, schedule.total_len(), embed_dim), "pos_1LC", trunc_normal)?;

        let lvl_table = vb.pp("lvl_embed").get_with_hints(
            (schedule.num_scales(), embed_dim),
            "weight",
            trunc_normal,
        )?;
        let lvl_embed = Embedding::new(lvl_table, embed_dim);
        let labels = Tensor::new(schedule.level_labels(), vb.device())?.unsqueeze(0)?;
        let lvl_pos = lvl_embed.forward(&labels)?.broadcast_add(&pos_1lc)?;

        Ok(Self {
            noise,
            cond_proj,
            pos_start,
            lvl_pos,
            n_cond_embed,
        })
    }

    pub fn n_cond_embed(&self) -> usize {
        self.n_cond_embed
    }

    /// `[B, n_cond]` text embeddings → `[2B, C]` guidance batch.
    pub fn mix(&self, embed: &Tensor) -> Result<Tensor> {
        let (b_sz, _) = embed.dims2()?;
        let uncond = self
            .noise
            .to_dtype(embed.dtype())?
            .broadcast_as((b_sz, self.n_cond_embed))?;
        Tensor::cat(&[embed, &uncond], 0)?.apply(&self.cond_proj)
    }

    /// Position + level embedding for the tokens of scale `si`, `[1, pn², C]`.
    pub fn scale_position(&self, schedule: &ScaleSchedule, si: usize) -> Result<Tensor> {
        self.lvl_pos
            .narrow(1, schedule.offset(si), schedule.scale_len(si))
    }

    /// Input to the first scale: every token starts from its row's condition.
    pub fn first_token_map(&self, schedule: &ScaleSchedule, cond: &Tensor) -> Result<Tensor> {
        let (b2, embed_dim) = cond.dims2()?;
        let first_len = schedule.first_len();
        cond.unsqueeze(1)?
            .broadcast_as((b2, first_len, embed_dim))?
            .broadcast_add(&self.pos_start)?
            .broadcast_add(&self.scale_position(schedule, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn mixer(device: &Device) -> (VarMap, ConditioningMixer, ScaleSchedule) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let schedule = ScaleSchedule::new(&[1, 2, 3]).unwrap();
        let mixer = ConditioningMixer::new(6, 8, &schedule, vb).unwrap();
        (varmap, mixer, schedule)
    }

    #[test]
    fn mix_doubles_the_batch() {
        let device = Device::Cpu;
        let (_vm, mixer, _) = mixer(&device);
        let embed = Tensor::randn(0f32, 1.0, (3, 6), &device).unwrap();
        let cond = mixer.mix(&embed).unwrap();
        assert_eq!(cond.dims(), &[6, 8]);
    }

    #[test]
    fn unconditional_rows_ignore_the_prompt() {
        let device = Device::Cpu;
        let (_vm, mixer, _) = mixer(&device);
        let a = Tensor::randn(0f32, 1.0, (2, 6), &device).unwrap();
        let b = Tensor::randn(0f32, 1.0, (2, 6), &device).unwrap();

        let uncond_a: Vec<Vec<f32>> = mixer
            .mix(&a)
            .unwrap()
            .narrow(0, 2, 2)
            .unwrap()
            .to_vec2()
            .unwrap();
        let uncond_b: Vec<Vec<f32>> = mixer
            .mix(&b)
            .unwrap()
            .narrow(0, 2, 2)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(uncond_a, uncond_b);
        // one shared null condition across the batch
        assert_eq!(uncond_a[0], uncond_a[1]);
    }

    #[test]
    fn scale_positions_cover_each_scale() {
        let device = Device::Cpu;
        let (_vm, mixer, schedule) = mixer(&device);
        for si in 0..schedule.num_scales() {
            let pos = mixer.scale_position(&schedule, si).unwrap();
            assert_eq!(pos.dims(), &[1, schedule.scale_len(si), 8]);
        }
    }

    #[test]
    fn first_token_map_shape() {
        let device = Device::Cpu;
        let (_vm, mixer, schedule) = mixer(&device);
        let embed = Tensor::randn(0f32, 1.0, (2, 6), &device).unwrap();
        let cond = mixer.mix(&embed).unwrap();
        let map = mixer.first_token_map(&schedule, &cond).unwrap();
        assert_eq!(map.dims(), &[4, 1, 8]);
    }
}
