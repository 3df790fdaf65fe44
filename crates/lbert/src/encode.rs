//! High-level encoding facade.

use candle_core::{Device, Tensor};
use lbert_core::checkpoint::Checkpoint;
use lbert_core::config::{BertConfig, EmbeddingFlags};
use lbert_core::model::{ForwardInputs, LbertModel, ModelOptions, ModelOutput};
use lbert_core::pooler::DEFAULT_TERMINATOR_ID;
use lbert_core::{LbertError, Result};
use std::path::PathBuf;
use tracing::{debug, info};

/// Builder for creating an [`Encoder`].
pub struct EncoderBuilder {
    config: Option<BertConfig>,
    config_path: Option<PathBuf>,
    cluster_embeddings: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
    flags: EmbeddingFlags,
    terminator_id: u32,
    seed: u64,
    is_training: bool,
    use_one_hot_embeddings: bool,
    device: Device,
}

impl EncoderBuilder {
    /// Create a new encoder builder.
    pub fn new() -> Self {
        Self {
            config: None,
            config_path: None,
            cluster_embeddings: None,
            checkpoint: None,
            flags: EmbeddingFlags::default(),
            terminator_id: DEFAULT_TERMINATOR_ID,
            seed: 1,
            is_training: false,
            use_one_hot_embeddings: false,
            device: Device::Cpu,
        }
    }

    /// Set the model configuration directly. Takes precedence over
    /// [`EncoderBuilder::config_file`].
    pub fn config(mut self, config: BertConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Load the model configuration from a JSON file.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set the cluster-embedding file path (required).
    pub fn cluster_embeddings(mut self, path: impl Into<PathBuf>) -> Self {
        self.cluster_embeddings = Some(path.into());
        self
    }

    /// Warm-start from a SafeTensors checkpoint file or directory.
    pub fn checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Select the optional embedding channels.
    pub fn flags(mut self, flags: EmbeddingFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the terminator token id.
    pub fn terminator_id(mut self, id: u32) -> Self {
        self.terminator_id = id;
        self
    }

    /// Set the initialization seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Keep the configured dropout probabilities active.
    pub fn training(mut self, is_training: bool) -> Self {
        self.is_training = is_training;
        self
    }

    /// Use the one-hot-times-matrix embedding lookup.
    pub fn one_hot_embeddings(mut self, enabled: bool) -> Self {
        self.use_one_hot_embeddings = enabled;
        self
    }

    /// Set the device the parameters live on.
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Build the encoder.
    pub fn build(self) -> Result<Encoder> {
        let config = match (self.config, &self.config_path) {
            (Some(config), _) => config,
            (None, Some(path)) => BertConfig::from_file(path)?,
            (None, None) => {
                return Err(LbertError::Config(
                    "either a config or a config file must be given".to_string(),
                ))
            }
        };
        let cluster_embeddings = self.cluster_embeddings.ok_or_else(|| {
            LbertError::Config("a cluster-embedding file must be given".to_string())
        })?;

        let options = ModelOptions {
            is_training: self.is_training,
            flags: self.flags,
            cluster_embeddings,
            terminator_id: self.terminator_id,
            seed: self.seed,
            use_one_hot_embeddings: self.use_one_hot_embeddings,
        };
        let mut model = LbertModel::new(&config, &options, &self.device)?;
        info!(
            hidden_size = config.hidden_size,
            num_hidden_layers = config.num_hidden_layers,
            num_attention_heads = config.num_attention_heads,
            "model built"
        );

        if let Some(path) = &self.checkpoint {
            let checkpoint = if path.is_dir() {
                Checkpoint::from_dir(path, &self.device)?
            } else {
                Checkpoint::from_file(path, &self.device)?
            };
            let restored = model.warm_start(&checkpoint)?;
            info!(
                restored = restored.len(),
                stored = checkpoint.len(),
                "warm-started from checkpoint"
            );
            debug!(?restored, "restored variables");
        }

        Ok(Encoder {
            model,
            device: self.device,
        })
    }
}

impl Default for EncoderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// High-level sentence encoder over the L-BERT model.
#[derive(Debug)]
pub struct Encoder {
    model: LbertModel,
    device: Device,
}

impl Encoder {
    /// Create a new encoder builder.
    pub fn builder() -> EncoderBuilder {
        EncoderBuilder::new()
    }

    /// The underlying model.
    pub fn model(&self) -> &LbertModel {
        &self.model
    }

    /// Effective model configuration.
    pub fn config(&self) -> &BertConfig {
        self.model.config()
    }

    /// Encode a batch of id sequences.
    ///
    /// Sequences may have different lengths; every row is right-padded with
    /// id 0 to the longest row and the attention mask is derived from the
    /// original lengths. `cluster_ids` must align row-by-row with
    /// `input_ids`.
    pub fn encode(&self, input_ids: &[Vec<u32>], cluster_ids: &[Vec<u32>]) -> Result<Encoding> {
        if input_ids.is_empty() {
            return Err(LbertError::InvalidInput("empty batch".to_string()));
        }
        if input_ids.len() != cluster_ids.len() {
            return Err(LbertError::InvalidInput(format!(
                "{} input rows but {} cluster rows",
                input_ids.len(),
                cluster_ids.len()
            )));
        }
        for (row, (words, clusters)) in input_ids.iter().zip(cluster_ids.iter()).enumerate() {
            if words.is_empty() {
                return Err(LbertError::InvalidInput(format!("row {row} is empty")));
            }
            if words.len() != clusters.len() {
                return Err(LbertError::InvalidInput(format!(
                    "row {row} has {} word ids but {} cluster ids",
                    words.len(),
                    clusters.len()
                )));
            }
        }

        let batch = input_ids.len();
        let seq_len = input_ids.iter().map(Vec::len).max().unwrap_or(0);
        debug!(batch, seq_len, "encoding batch");

        let words = self.pad_ids(input_ids, seq_len)?;
        let clusters = self.pad_ids(cluster_ids, seq_len)?;
        let mut mask = Vec::with_capacity(batch * seq_len);
        for row in input_ids {
            mask.extend(std::iter::repeat(1.0f32).take(row.len()));
            mask.extend(std::iter::repeat(0.0f32).take(seq_len - row.len()));
        }
        let mask = Tensor::from_vec(mask, (batch, seq_len), &self.device)?;

        let mut inputs = ForwardInputs::new(words, clusters);
        inputs.input_mask = Some(mask);
        let output = self.model.forward(&inputs)?;
        let pooled = output.pooled_output.to_vec2()?;

        Ok(Encoding { pooled, output })
    }

    /// Run a raw forward pass with caller-built tensors.
    pub fn forward(&self, inputs: &ForwardInputs) -> Result<ModelOutput> {
        self.model.forward(inputs)
    }

    fn pad_ids(&self, rows: &[Vec<u32>], seq_len: usize) -> Result<Tensor> {
        let mut flat = Vec::with_capacity(rows.len() * seq_len);
        for row in rows {
            flat.extend_from_slice(row);
            flat.extend(std::iter::repeat(0u32).take(seq_len - row.len()));
        }
        Ok(Tensor::from_vec(flat, (rows.len(), seq_len), &self.device)?)
    }
}

/// Result of encoding a batch.
#[derive(Debug)]
pub struct Encoding {
    /// Host-side pooled vectors, one per batch row.
    pub pooled: Vec<Vec<f32>>,
    /// Full model output, still on the device.
    pub output: ModelOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_cluster_tsv(name: &str, rows: usize, cols: usize) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        for row in 0..rows {
            let vector: Vec<String> = (0..cols)
                .map(|col| format!("{:.4}", ((row + col) % 11) as f32 * 0.01))
                .collect();
            writeln!(file, "{row}\t{}", vector.join(",")).unwrap();
        }
        path
    }

    fn small_config() -> BertConfig {
        let mut config = BertConfig::new(40, 12);
        config.hidden_size = 16;
        config.num_attention_heads = 4;
        config.intermediate_size = 32;
        config.num_hidden_layers = 2;
        config.max_position_embeddings = 8;
        config
    }

    #[test]
    fn builder_requires_a_config() {
        let path = write_cluster_tsv("lbert_enc_noconf.tsv", 12, 16);
        let err = Encoder::builder()
            .cluster_embeddings(&path)
            .build()
            .unwrap_err();
        assert!(matches!(err, LbertError::Config(_)));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn builder_requires_cluster_embeddings() {
        let err = Encoder::builder()
            .config(small_config())
            .build()
            .unwrap_err();
        assert!(matches!(err, LbertError::Config(_)));
    }

    #[test]
    fn builds_from_config_file() {
        let path = write_cluster_tsv("lbert_enc_file.tsv", 12, 16);
        let config_path = std::env::temp_dir().join("lbert_enc_config.json");
        std::fs::write(
            &config_path,
            serde_json::to_string(&small_config()).unwrap(),
        )
        .unwrap();

        let encoder = Encoder::builder()
            .config_file(&config_path)
            .cluster_embeddings(&path)
            .build()
            .unwrap();
        assert_eq!(encoder.config().hidden_size, 16);
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(config_path);
    }

    #[test]
    fn encodes_a_ragged_batch() {
        let path = write_cluster_tsv("lbert_enc_ragged.tsv", 12, 16);
        let encoder = Encoder::builder()
            .config(small_config())
            .cluster_embeddings(&path)
            .build()
            .unwrap();

        let encoding = encoder
            .encode(
                &[vec![3, 7, 11, 2], vec![5, 9]],
                &[vec![1, 2, 3, 4], vec![5, 6]],
            )
            .unwrap();
        assert_eq!(encoding.pooled.len(), 2);
        assert_eq!(encoding.pooled[0].len(), 16);
        assert_eq!(encoding.output.sequence_output.dims(), &[2, 4, 16]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejects_misaligned_rows() {
        let path = write_cluster_tsv("lbert_enc_misalign.tsv", 12, 16);
        let encoder = Encoder::builder()
            .config(small_config())
            .cluster_embeddings(&path)
            .build()
            .unwrap();

        let err = encoder
            .encode(&[vec![1, 2, 3]], &[vec![1, 2]])
            .unwrap_err();
        assert!(matches!(err, LbertError::InvalidInput(_)));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn core_modules_stay_reachable_through_reexport() {
        // The facade must not shadow the re-exported core namespaces.
        let _ = std::any::type_name::<crate::encoder::TransformerEncoder>();
        let margin = crate::attention::distance_margin(3, &Device::Cpu).unwrap();
        assert_eq!(margin.dims(), &[3, 3]);
    }

    #[test]
    fn same_seed_gives_identical_encoders() {
        let path = write_cluster_tsv("lbert_enc_seed.tsv", 12, 16);
        let a = Encoder::builder()
            .config(small_config())
            .cluster_embeddings(&path)
            .seed(7)
            .build()
            .unwrap();
        let b = Encoder::builder()
            .config(small_config())
            .cluster_embeddings(&path)
            .seed(7)
            .build()
            .unwrap();

        let ids = [vec![1u32, 2, 3]];
        let clusters = [vec![4u32, 5, 6]];
        let pa = a.encode(&ids, &clusters).unwrap().pooled;
        let pb = b.encode(&ids, &clusters).unwrap().pooled;
        assert_eq!(pa, pb);
        let _ = std::fs::remove_file(path);
    }
}
