//! The assembled L-BERT model.
//!
//! Data flow: id tensors -> word + cluster embedding lookup ->
//! channel composition and normalization -> attention-mask construction ->
//! transformer stack -> pooling head. Parameter tables are read-only
//! during a forward pass; the only state is the tables themselves.

use crate::attention::attention_mask_from_input_mask;
use crate::checkpoint::Checkpoint;
use crate::config::{BertConfig, EmbeddingFlags};
use crate::embedding::{EmbeddingComposer, EmbeddingTable};
use crate::encoder::TransformerEncoder;
use crate::error::{LbertError, Result};
use crate::init::{Init, SeedStream};
use crate::pooler::{Pooler, DEFAULT_TERMINATOR_ID};
use crate::shape;
use candle_core::{DType, Device, Tensor};
use std::path::PathBuf;

/// Construction-time options beyond the hyperparameter config.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    /// Keep the configured dropout probabilities; when false both are
    /// zeroed before the model is built.
    pub is_training: bool,
    /// Which optional embedding channels to compose.
    pub flags: EmbeddingFlags,
    /// Path of the tab-separated cluster-embedding initializer file.
    pub cluster_embeddings: PathBuf,
    /// Sentinel id located by the terminator pooling path.
    pub terminator_id: u32,
    /// Seed threaded into every parameter initializer.
    pub seed: u64,
    /// Use the one-hot-times-matrix lookup instead of indexed gather.
    pub use_one_hot_embeddings: bool,
}

impl ModelOptions {
    /// Options with defaults for everything except the embedding file.
    pub fn new(cluster_embeddings: impl Into<PathBuf>) -> Self {
        Self {
            is_training: false,
            flags: EmbeddingFlags::default(),
            cluster_embeddings: cluster_embeddings.into(),
            terminator_id: DEFAULT_TERMINATOR_ID,
            seed: 1,
            use_one_hot_embeddings: false,
        }
    }
}

/// One batch of forward-pass inputs. All tensors are `[batch, seq_len]`
/// and must agree on both dims.
#[derive(Debug, Clone)]
pub struct ForwardInputs {
    /// Word-piece ids (required).
    pub input_ids: Tensor,
    /// Lexical-cluster ids (required).
    pub cluster_ids: Tensor,
    /// Chunk-context ids. Validated for shape but reserved for the
    /// disabled chunk-context channel.
    pub context_ids: Option<Tensor>,
    /// Attention mask, 1 = real token, 0 = padding. Defaults to all-ones.
    pub input_mask: Option<Tensor>,
    /// Context mask driving the entity channel. Defaults to all-ones.
    pub context_mask: Option<Tensor>,
    /// Token-type (segment) ids. Defaults to all-zeros.
    pub token_type_ids: Option<Tensor>,
}

impl ForwardInputs {
    /// Inputs with only the required id tensors.
    pub fn new(input_ids: Tensor, cluster_ids: Tensor) -> Self {
        Self {
            input_ids,
            cluster_ids,
            context_ids: None,
            input_mask: None,
            context_mask: None,
            token_type_ids: None,
        }
    }
}

/// Everything a forward pass produces.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Hidden state of every encoder layer, each `[B, L, H]`.
    pub all_encoder_layers: Vec<Tensor>,
    /// Final hidden state (last element of `all_encoder_layers`).
    pub sequence_output: Tensor,
    /// Encoder input after embedding composition and normalization.
    pub embedding_output: Tensor,
    /// Word-embedding lookup before composition.
    pub word_output: Tensor,
    /// Cluster-embedding lookup before composition.
    pub cluster_output: Tensor,
    /// First-token pooled representation `[B, H]`.
    pub pooled_output: Tensor,
}

/// L-BERT encoder: word + lexical-cluster embeddings feeding a stack of
/// distance-biased attention layers.
#[derive(Debug, Clone)]
pub struct LbertModel {
    config: BertConfig,
    flags: EmbeddingFlags,
    word_embeddings: EmbeddingTable,
    cluster_embeddings: EmbeddingTable,
    composer: EmbeddingComposer,
    encoder: TransformerEncoder,
    pooler: Pooler,
    use_one_hot_embeddings: bool,
    device: Device,
}

impl LbertModel {
    /// Build the model. Fails on an invalid config or an unreadable or
    /// malformed cluster-embedding file; nothing is deferred to the
    /// forward pass.
    pub fn new(config: &BertConfig, options: &ModelOptions, device: &Device) -> Result<Self> {
        config.validate()?;
        let config = if options.is_training {
            config.clone()
        } else {
            config.for_inference()
        };

        let mut seeds = SeedStream::new(options.seed);
        let random_init = Init::TruncatedNormal {
            stddev: config.initializer_range,
        };
        let word_embeddings = EmbeddingTable::new(
            config.vocab_size,
            config.hidden_size,
            &random_init,
            seeds.next_seed(),
            device,
        )?;
        // Fixed, file-sourced initial values; still an ordinary parameter.
        let cluster_init = Init::FromTsvFile {
            path: options.cluster_embeddings.clone(),
        };
        let cluster_embeddings = EmbeddingTable::new(
            config.cluster_size,
            config.hidden_size,
            &cluster_init,
            seeds.next_seed(),
            device,
        )?;

        let composer = EmbeddingComposer::new(&config, options.flags, &mut seeds, device)?;
        let encoder = TransformerEncoder::new(&config, &mut seeds, device)?;
        let pooler = Pooler::new(&config, options.terminator_id, &mut seeds, device)?;

        Ok(Self {
            config,
            flags: options.flags,
            word_embeddings,
            cluster_embeddings,
            composer,
            encoder,
            pooler,
            use_one_hot_embeddings: options.use_one_hot_embeddings,
            device: device.clone(),
        })
    }

    /// Run the forward pass.
    pub fn forward(&self, inputs: &ForwardInputs) -> Result<ModelOutput> {
        let id_dims = shape::dims(&inputs.input_ids, 2, "input_ids")?;
        let (batch, seq_len) = (id_dims[0], id_dims[1]);
        self.check_aligned(&inputs.cluster_ids, batch, seq_len, "cluster_ids")?;
        for (tensor, name) in [
            (&inputs.context_ids, "context_ids"),
            (&inputs.input_mask, "input_mask"),
            (&inputs.context_mask, "context_mask"),
            (&inputs.token_type_ids, "token_type_ids"),
        ] {
            if let Some(t) = tensor {
                self.check_aligned(t, batch, seq_len, name)?;
            }
        }

        let input_mask = match &inputs.input_mask {
            Some(mask) => mask.to_dtype(DType::F32)?,
            None => Tensor::ones((batch, seq_len), DType::F32, &self.device)?,
        };
        let context_mask = match &inputs.context_mask {
            Some(mask) => mask.clone(),
            None => Tensor::ones((batch, seq_len), DType::U32, &self.device)?,
        };
        let token_type_ids = match &inputs.token_type_ids {
            Some(ids) => ids.clone(),
            None => Tensor::zeros((batch, seq_len), DType::U32, &self.device)?,
        };

        let word_output = self
            .word_embeddings
            .lookup(&inputs.input_ids, self.use_one_hot_embeddings)?;
        let cluster_output = self
            .cluster_embeddings
            .lookup(&inputs.cluster_ids, self.use_one_hot_embeddings)?;
        let summed = (&word_output + &cluster_output)?;

        let entity_ids = self.flags.use_entity_embedding.then_some(&context_mask);
        let embedding_output = self
            .composer
            .forward(&summed, Some(&token_type_ids), entity_ids)?;

        let attention_mask = attention_mask_from_input_mask(&input_mask, seq_len)?;
        let all_encoder_layers = self.encoder.forward_all(&embedding_output, &attention_mask)?;
        let sequence_output = all_encoder_layers
            .last()
            .cloned()
            .ok_or_else(|| LbertError::Config("encoder has no layers".to_string()))?;

        let pooled_output = self.pooler.forward(&sequence_output)?;

        Ok(ModelOutput {
            all_encoder_layers,
            sequence_output,
            embedding_output,
            word_output,
            cluster_output,
            pooled_output,
        })
    }

    /// Hidden vector at the terminator token; see
    /// [`Pooler::terminator_output`].
    pub fn terminator_output(
        &self,
        sequence_output: &Tensor,
        input_ids: &Tensor,
    ) -> Result<Tensor> {
        self.pooler.terminator_output(sequence_output, input_ids)
    }

    fn check_aligned(
        &self,
        tensor: &Tensor,
        batch: usize,
        seq_len: usize,
        name: &str,
    ) -> Result<()> {
        let dims = shape::dims(tensor, 2, name)?;
        if dims[0] != batch || dims[1] != seq_len {
            return Err(LbertError::ShapeMismatch(format!(
                "tensor `{name}` has shape {dims:?}, expected [{batch}, {seq_len}]"
            )));
        }
        Ok(())
    }

    /// The word-embedding table, for tied-weight downstream use.
    pub fn embedding_table(&self) -> &Tensor {
        self.word_embeddings.table()
    }

    /// The cluster-embedding table.
    pub fn cluster_embedding_table(&self) -> &Tensor {
        self.cluster_embeddings.table()
    }

    /// Effective config (dropout already zeroed unless training).
    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    /// Device the parameters live on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Stable dotted names of every live parameter.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = vec![
            "embeddings.word_embeddings".to_string(),
            "embeddings.cluster_embeddings".to_string(),
        ];
        self.composer.parameter_names(&mut names);
        self.encoder.parameter_names(&mut names);
        self.pooler.parameter_names(&mut names);
        names
    }

    /// Warm-start from a checkpoint: every live parameter whose name the
    /// checkpoint stores (minus the excluded classification head) is
    /// overwritten, shape-checked. Returns the restored names.
    pub fn warm_start(&mut self, checkpoint: &Checkpoint) -> Result<Vec<String>> {
        let map = checkpoint.assignment_map(&self.parameter_names());
        let mut restored = Vec::new();
        self.word_embeddings
            .restore(&map, "embeddings.word_embeddings", &mut restored)?;
        self.cluster_embeddings
            .restore(&map, "embeddings.cluster_embeddings", &mut restored)?;
        self.composer.restore(&map, &mut restored)?;
        self.encoder.restore(&map, &mut restored)?;
        self.pooler.restore(&map, &mut restored)?;
        Ok(restored)
    }
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
                .map(|col| format!("{:.4}", ((row * cols + col) % 17) as f32 * 0.01 - 0.08))
                .collect();
            writeln!(file, "{row}\t{}", vector.join(",")).unwrap();
        }
        path
    }

    fn ids(data: &[&[u32]]) -> Tensor {
        let rows = data.len();
        let cols = data[0].len();
        let flat: Vec<u32> = data.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows, cols), &Device::Cpu).unwrap()
    }

    fn small_config() -> BertConfig {
        let mut config = BertConfig::new(50, 20);
        config.hidden_size = 16;
        config.num_attention_heads = 4;
        config.intermediate_size = 32;
        config.num_hidden_layers = 2;
        config.max_position_embeddings = 8;
        config.type_vocab_size = 4;
        config
    }

    fn small_model(tsv_name: &str) -> (LbertModel, PathBuf) {
        let config = small_config();
        let path = write_cluster_tsv(tsv_name, config.cluster_size, config.hidden_size);
        let options = ModelOptions::new(&path);
        let model = LbertModel::new(&config, &options, &Device::Cpu).unwrap();
        (model, path)
    }

    #[test]
    fn construction_fails_on_non_divisible_heads() {
        let mut config = small_config();
        config.hidden_size = 15;
        let path = write_cluster_tsv("lbert_model_div.tsv", config.cluster_size, 15);
        let err = LbertModel::new(&config, &ModelOptions::new(&path), &Device::Cpu).unwrap_err();
        assert!(matches!(err, LbertError::Config(_)));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn construction_fails_on_missing_embedding_file() {
        let config = small_config();
        let options = ModelOptions::new("/nonexistent/embedding.tsv");
        let err = LbertModel::new(&config, &options, &Device::Cpu).unwrap_err();
        assert!(matches!(err, LbertError::EmbeddingFile(_)));
    }

    #[test]
    fn forward_produces_all_outputs() {
        let (model, path) = small_model("lbert_model_fwd.tsv");
        let inputs = ForwardInputs {
            input_ids: ids(&[&[3, 7, 11], &[2, 5, 0]]),
            cluster_ids: ids(&[&[1, 2, 3], &[4, 5, 6]]),
            context_ids: None,
            input_mask: Some(ids(&[&[1, 1, 1], &[1, 1, 0]])),
            context_mask: None,
            token_type_ids: Some(ids(&[&[0, 0, 1], &[0, 2, 0]])),
        };
        let output = model.forward(&inputs).unwrap();

        assert_eq!(output.all_encoder_layers.len(), 2);
        assert_eq!(output.sequence_output.dims(), &[2, 3, 16]);
        assert_eq!(output.embedding_output.dims(), &[2, 3, 16]);
        assert_eq!(output.word_output.dims(), &[2, 3, 16]);
        assert_eq!(output.cluster_output.dims(), &[2, 3, 16]);
        assert_eq!(output.pooled_output.dims(), &[2, 16]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn defaults_fill_optional_inputs() {
        let (model, path) = small_model("lbert_model_defaults.tsv");
        let inputs = ForwardInputs::new(ids(&[&[1, 2]]), ids(&[&[3, 4]]));
        let output = model.forward(&inputs).unwrap();
        assert_eq!(output.pooled_output.dims(), &[1, 16]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn misaligned_batch_fails() {
        let (model, path) = small_model("lbert_model_align.tsv");
        let inputs = ForwardInputs::new(ids(&[&[1, 2, 3]]), ids(&[&[1, 2]]));
        assert!(model.forward(&inputs).is_err());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn out_of_range_word_id_fails_fast() {
        let (model, path) = small_model("lbert_model_range.tsv");
        let inputs = ForwardInputs::new(ids(&[&[49, 50]]), ids(&[&[0, 0]]));
        let err = model.forward(&inputs).unwrap_err();
        assert!(matches!(err, LbertError::InvalidInput(_)));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn sequence_beyond_position_capacity_fails() {
        let (model, path) = small_model("lbert_model_maxpos.tsv");
        // max_position_embeddings is 8; 9 tokens must be a fatal error.
        let row: Vec<u32> = (0..9).collect();
        let inputs = ForwardInputs::new(ids(&[&row]), ids(&[&[0; 9]]));
        let err = model.forward(&inputs).unwrap_err();
        assert!(matches!(err, LbertError::Config(_)));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn same_seed_reproduces_same_outputs() {
        let config = small_config();
        let path = write_cluster_tsv("lbert_model_seed.tsv", config.cluster_size, 16);

        let a = LbertModel::new(&config, &ModelOptions::new(&path), &Device::Cpu).unwrap();
        let b = LbertModel::new(&config, &ModelOptions::new(&path), &Device::Cpu).unwrap();
        let mut options_c = ModelOptions::new(&path);
        options_c.seed = 99;
        let c = LbertModel::new(&config, &options_c, &Device::Cpu).unwrap();

        let inputs = ForwardInputs::new(ids(&[&[1, 2, 3]]), ids(&[&[4, 5, 6]]));
        let pa: Vec<f32> = a.forward(&inputs).unwrap().pooled_output.flatten_all().unwrap().to_vec1().unwrap();
        let pb: Vec<f32> = b.forward(&inputs).unwrap().pooled_output.flatten_all().unwrap().to_vec1().unwrap();
        let pc: Vec<f32> = c.forward(&inputs).unwrap().pooled_output.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(pa, pb);
        assert_ne!(pa, pc);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn gather_and_one_hot_models_agree() {
        let config = small_config();
        let path = write_cluster_tsv("lbert_model_onehot.tsv", config.cluster_size, 16);

        let gather = LbertModel::new(&config, &ModelOptions::new(&path), &Device::Cpu).unwrap();
        let mut options = ModelOptions::new(&path);
        options.use_one_hot_embeddings = true;
        let one_hot = LbertModel::new(&config, &options, &Device::Cpu).unwrap();

        let inputs = ForwardInputs::new(ids(&[&[7, 8, 9]]), ids(&[&[1, 1, 2]]));
        let a: Vec<f32> = gather.forward(&inputs).unwrap().pooled_output.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = one_hot.forward(&inputs).unwrap().pooled_output.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
        let _ = std::fs::remove_file(path);
    }

    // The default sentinel 1475 lies outside the tiny test vocabulary.
    const TEST_TERMINATOR_ID: u32 = 42;

    #[test]
    fn terminator_output_via_model() {
        let config = small_config();
        let path = write_cluster_tsv("lbert_model_term.tsv", config.cluster_size, 16);
        let mut options = ModelOptions::new(&path);
        options.terminator_id = TEST_TERMINATOR_ID;
        let model = LbertModel::new(&config, &options, &Device::Cpu).unwrap();

        let input_ids = ids(&[&[1, TEST_TERMINATOR_ID, 3]]);
        let inputs = ForwardInputs::new(input_ids.clone(), ids(&[&[0, 1, 2]]));
        let output = model.forward(&inputs).unwrap();

        let term = model
            .terminator_output(&output.sequence_output, &input_ids)
            .unwrap();
        assert_eq!(term.dims(), &[1, 16]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn warm_start_restores_intersection_only() {
        use safetensors::tensor::TensorView;

        let (mut model, tsv_path) = small_model("lbert_model_warm.tsv");
        let bias = vec![0.5f32; 16];
        let head = vec![0.0f32; 4];
        let views = vec![
            (
                "pooler.dense.bias".to_string(),
                TensorView::new(safetensors::Dtype::F32, vec![16], bytemuck::cast_slice(&bias))
                    .unwrap(),
            ),
            (
                "output_bias".to_string(),
                TensorView::new(safetensors::Dtype::F32, vec![4], bytemuck::cast_slice(&head))
                    .unwrap(),
            ),
        ];
        let ckpt_path = std::env::temp_dir().join("lbert_model_warm.safetensors");
        safetensors::serialize_to_file(views, &None, &ckpt_path).unwrap();

        let checkpoint = Checkpoint::from_file(&ckpt_path, &Device::Cpu).unwrap();
        let restored = model.warm_start(&checkpoint).unwrap();
        assert_eq!(restored, vec!["pooler.dense.bias".to_string()]);

        let _ = std::fs::remove_file(tsv_path);
        let _ = std::fs::remove_file(ckpt_path);
    }

    #[test]
    fn parameter_names_cover_every_module() {
        let (model, path) = small_model("lbert_model_names.tsv");
        let names = model.parameter_names();
        assert!(names.contains(&"embeddings.word_embeddings".to_string()));
        assert!(names.contains(&"embeddings.cluster_embeddings".to_string()));
        assert!(names.contains(&"embeddings.position_embeddings".to_string()));
        assert!(names.contains(&"encoder.layer_0.attention.self.query.weight".to_string()));
        assert!(names.contains(&"encoder.layer_1.output.layer_norm.beta".to_string()));
        assert!(names.contains(&"pooler.dense.weight".to_string()));
        // 2 word/cluster + 4 composer (two tables + norm) + 2 layers x 16
        // + 2 pooler.
        assert_eq!(names.len(), 2 + 4 + 2 * 16 + 2);
        let _ = std::fs::remove_file(path);
    }

    // The published reference scenario, with 8 heads instead of the
    // original 6 so the head-divisibility invariant holds for hidden 512.
    #[test]
    fn reference_scenario_pooled_output_is_finite() {
        let mut config = BertConfig::new(32000, 236);
        config.hidden_size = 512;
        config.num_hidden_layers = 8;
        config.num_attention_heads = 8;
        config.intermediate_size = 1024;
        let path = write_cluster_tsv("lbert_model_reference.tsv", 236, 512);

        let model = LbertModel::new(&config, &ModelOptions::new(&path), &Device::Cpu).unwrap();
        let inputs = ForwardInputs {
            input_ids: ids(&[&[31, 51, 99], &[15, 5, 0]]),
            cluster_ids: ids(&[&[7, 45, 234], &[7, 78, 235]]),
            context_ids: None,
            input_mask: Some(ids(&[&[1, 1, 1], &[1, 1, 0]])),
            context_mask: None,
            token_type_ids: Some(ids(&[&[0, 0, 1], &[0, 2, 0]])),
        };
        let output = model.forward(&inputs).unwrap();

        assert_eq!(output.pooled_output.dims(), &[2, 512]);
        let pooled: Vec<f32> = output
            .pooled_output
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(pooled.iter().all(|v| v.is_finite()));
        let _ = std::fs::remove_file(path);
    }
}
