use anyhow::{anyhow, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::xlm_roberta::{Config as XLMRobertaConfig, XLMRobertaModel};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use ragdb_core::config::expand_path;
use ragdb_core::error::{Error, Result};
use ragdb_core::traits::{check_encodable, Encoder};
use ragdb_core::types::SparseTerms;
use ragdb_text::Analyzer;

use crate::device::select_device;
use crate::pool::masked_mean_l2;
use crate::tokenize::tokenize_on_device;

/// Subword window fed to the transformer.
const MAX_SEQ_LEN: usize = 512;

/// BGE-M3 style encoder: XLM-RoBERTa hidden states, masked mean pooling and
/// L2 normalisation for dense vectors; analyzed terms for the sparse side.
pub struct ModelEncoder {
    model: XLMRobertaModel,
    tokenizer: Tokenizer,
    device: Device,
    analyzer: Analyzer,
    dim: usize,
    max_tokens: usize,
}

impl ModelEncoder {
    pub fn load(model_dir: Option<&str>, max_tokens: usize) -> Result<Self> {
        Self::try_load(model_dir, max_tokens).map_err(|e| Error::encoding(format!("{e:#}")))
    }

    fn try_load(model_dir: Option<&str>, max_tokens: usize) -> anyhow::Result<Self> {
        let device = select_device();
        let model_dir = resolve_model_dir(model_dir)?;
        info!(dir = %model_dir.display(), "loading encoder model");

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", tokenizer_path.display(), e))?;
        let config_path = model_dir.join("config.json");
        let config: XLMRobertaConfig = serde_json::from_str(
            &std::fs::read_to_string(&config_path).with_context(|| format!("reading {}", config_path.display()))?,
        )?;

        let safetensors = model_dir.join("model.safetensors");
        let weights: HashMap<String, Tensor> = if safetensors.exists() {
            candle_core::safetensors::load(&safetensors, &device)?
        } else {
            candle_core::pickle::read_all(model_dir.join("pytorch_model.bin"))?.into_iter().collect()
        };
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = XLMRobertaModel::new(&config, vb)?;
        info!(dim = config.hidden_size, "encoder model loaded");
        Ok(Self { model, tokenizer, device, analyzer: Analyzer::english(), dim: config.hidden_size, max_tokens })
    }

    fn forward(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let start = Instant::now();
        let (input_ids, attention_mask) = tokenize_on_device(&self.tokenizer, text, MAX_SEQ_LEN, &self.device)?;
        let token_type_ids = Tensor::zeros((1, MAX_SEQ_LEN), DType::I64, &self.device)?;
        let hidden = self.model.forward(&input_ids, &attention_mask, &token_type_ids, None, None, None)?;
        let pooled = masked_mean_l2(&hidden, &attention_mask)?;
        let v: Vec<f32> = pooled.to_device(&Device::Cpu)?.squeeze(0)?.to_vec1()?;
        let elapsed_ms = start.elapsed().as_millis();
        if elapsed_ms > 100 {
            warn!(elapsed_ms, "slow embedding");
        } else {
            debug!(elapsed_ms, "embedded text");
        }
        Ok(v)
    }
}

impl Encoder for ModelEncoder {
    fn name(&self) -> &str {
        "model"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    fn embed_dense(&self, text: &str) -> Result<Vec<f32>> {
        check_encodable(text, self.max_tokens)?;
        let v = self.forward(text).map_err(|e| Error::encoding(format!("{e:#}")))?;
        if v.len() != self.dim {
            return Err(Error::encoding(format!("model produced {} dims, expected {}", v.len(), self.dim)));
        }
        Ok(v)
    }

    fn embed_sparse(&self, text: &str) -> Result<SparseTerms> {
        check_encodable(text, self.max_tokens)?;
        Ok(self.analyzer.term_frequencies(text))
    }
}

fn resolve_model_dir(configured: Option<&str>) -> anyhow::Result<PathBuf> {
    let candidates = configured
        .map(expand_path)
        .into_iter()
        .chain(std::env::var("APP_MODEL_DIR").ok().map(PathBuf::from))
        .chain(std::env::var("MODEL_DIR").ok().map(PathBuf::from))
        .chain([Path::new("../models/bge-m3").to_path_buf(), Path::new("models/bge-m3").to_path_buf()]);
    for dir in candidates {
        if dir.exists() {
            return Ok(dir);
        }
    }
    Err(anyhow!("Could not locate encoder model directory. Checked encoder.model_dir, APP_MODEL_DIR, MODEL_DIR, ../models/bge-m3, and models/bge-m3"))
}
