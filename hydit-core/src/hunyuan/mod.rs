mod attention;
mod block;
mod embeddings;
mod model;
mod patch;
mod rope;

pub use attention::{CrossAttention, SelfAttention};
pub use block::{FinalLayer, HunYuanDiTBlock, SkipPlan, SkipStep};
pub use embeddings::{timestep_embedding, AttentionPool, PatchEmbed, TimestepEmbedder};
pub use model::{GuidedText, HunYuanDiT, TextEmbeddings};
pub use patch::{patchify, unpatchify};
pub use rope::{get_2d_rotary_pos_embed, get_fill_resize_and_crop, RopeEmbedding, RopeTable};
