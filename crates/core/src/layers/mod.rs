pub mod adaln;
pub mod attention;
pub mod interpolate;
pub mod kv_cache;
pub mod mlp;
pub mod normalization;

pub use adaln::{AdaLnBlock, AdaLnHead};
pub use attention::SelfAttention;
pub use kv_cache::{GenerationCache, KvCache};
pub use mlp::Ffn;
pub use normalization::{modulate, LayerNormNoAffine};
