//! Vision transformer backbone with the layout of timm's `vit_tiny_patch16_224`.
//!
//! Variable names mirror the PyTorch module tree (`patch_embed.proj`,
//! `blocks.N.attn.qkv`, ...) so checkpoints exported from PyTorch can be
//! assigned without any renaming. The classification head is omitted: the
//! forward pass returns the pooled class-token features.

use tch::nn::{self, Module, ModuleT};
use tch::{Kind, Tensor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VitConfig {
    pub image_size: i64,
    pub patch_size: i64,
    pub in_channels: i64,
    pub embed_dim: i64,
    pub depth: usize,
    pub num_heads: i64,
    pub mlp_ratio: i64,
    pub layer_norm_eps: f64,
}

impl VitConfig {
    pub const fn tiny_patch16_224() -> Self {
        Self {
            image_size: 224,
            patch_size: 16,
            in_channels: 3,
            embed_dim: 192,
            depth: 12,
            num_heads: 3,
            mlp_ratio: 4,
            layer_norm_eps: 1e-6,
        }
    }

    pub fn num_patches(&self) -> i64 {
        let per_side = self.image_size / self.patch_size;
        per_side * per_side
    }

    /// Width of the feature vector the backbone emits.
    pub fn num_features(&self) -> i64 {
        self.embed_dim
    }

    fn head_dim(&self) -> i64 {
        self.embed_dim / self.num_heads
    }

    fn layer_norm(&self) -> nn::LayerNormConfig {
        nn::LayerNormConfig {
            eps: self.layer_norm_eps,
            ..Default::default()
        }
    }
}

impl Default for VitConfig {
    fn default() -> Self {
        Self::tiny_patch16_224()
    }
}

#[derive(Debug)]
struct Attention {
    qkv: nn::Linear,
    proj: nn::Linear,
    num_heads: i64,
    head_dim: i64,
    scale: f64,
}

impl Attention {
    fn new(p: nn::Path, cfg: &VitConfig) -> Self {
        let dim = cfg.embed_dim;
        let head_dim = cfg.head_dim();
        Self {
            qkv: nn::linear(&p / "qkv", dim, dim * 3, Default::default()),
            proj: nn::linear(&p / "proj", dim, dim, Default::default()),
            num_heads: cfg.num_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        }
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (batch, tokens) = (size[0], size[1]);

        // [3, batch, heads, tokens, head_dim]
        let qkv = xs
            .apply(&self.qkv)
            .reshape([batch, tokens, 3, self.num_heads, self.head_dim])
            .permute([2, 0, 3, 1, 4]);
        let (q, k, v) = (qkv.get(0), qkv.get(1), qkv.get(2));

        let attn = (q.matmul(&k.transpose(-2, -1)) * self.scale).softmax(-1, Kind::Float);
        attn.matmul(&v)
            .transpose(1, 2)
            .reshape([batch, tokens, self.num_heads * self.head_dim])
            .apply(&self.proj)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl Mlp {
    fn new(p: nn::Path, cfg: &VitConfig) -> Self {
        let hidden = cfg.embed_dim * cfg.mlp_ratio;
        Self {
            fc1: nn::linear(&p / "fc1", cfg.embed_dim, hidden, Default::default()),
            fc2: nn::linear(&p / "fc2", hidden, cfg.embed_dim, Default::default()),
        }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        // exact (erf) GELU, as nn.GELU() defaults to
        xs.apply(&self.fc1).gelu("none").apply(&self.fc2)
    }
}

#[derive(Debug)]
struct Block {
    norm1: nn::LayerNorm,
    attn: Attention,
    norm2: nn::LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(p: nn::Path, cfg: &VitConfig) -> Self {
        Self {
            norm1: nn::layer_norm(&p / "norm1", vec![cfg.embed_dim], cfg.layer_norm()),
            attn: Attention::new(&p / "attn", cfg),
            norm2: nn::layer_norm(&p / "norm2", vec![cfg.embed_dim], cfg.layer_norm()),
            mlp: Mlp::new(&p / "mlp", cfg),
        }
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let attended = xs.apply(&self.norm1).apply(&self.attn);
        let xs = xs + attended;
        let mixed = xs.apply(&self.norm2).apply(&self.mlp);
        xs + mixed
    }
}

#[derive(Debug)]
pub struct VisionTransformer {
    patch_embed: nn::Conv2D,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: nn::LayerNorm,
    config: VitConfig,
}

impl VisionTransformer {
    pub fn new(p: nn::Path, config: VitConfig) -> Self {
        let conv = nn::ConvConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        let patch_embed = nn::conv2d(
            &p / "patch_embed" / "proj",
            config.in_channels,
            config.embed_dim,
            config.patch_size,
            conv,
        );
        let token_init = nn::Init::Randn {
            mean: 0.,
            stdev: 0.02,
        };
        let cls_token = p.var("cls_token", &[1, 1, config.embed_dim], token_init);
        let pos_embed = p.var(
            "pos_embed",
            &[1, config.num_patches() + 1, config.embed_dim],
            token_init,
        );
        let blocks_path = &p / "blocks";
        let blocks = (0..config.depth)
            .map(|i| Block::new(&blocks_path / i, &config))
            .collect();
        let norm = nn::layer_norm(&p / "norm", vec![config.embed_dim], config.layer_norm());

        Self {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
            config,
        }
    }

    pub fn config(&self) -> &VitConfig {
        &self.config
    }
}

impl ModuleT for VisionTransformer {
    /// `xs` is `[batch, 3, 224, 224]`; the result is `[batch, num_features]`.
    ///
    /// Dropout rates inside the backbone are all zero, so `train` does not
    /// change the output.
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let batch = xs.size()[0];
        let patches = xs.apply(&self.patch_embed).flatten(2, -1).transpose(1, 2);
        let cls = self.cls_token.expand([batch, -1, -1], false);
        let mut xs = Tensor::cat(&[cls, patches], 1) + &self.pos_embed;
        for block in &self.blocks {
            xs = xs.apply(block);
        }
        xs.apply(&self.norm).select(1, 0)
    }
}
