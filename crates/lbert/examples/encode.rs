//! Encode a small batch with a freshly initialized model.
//!
//! Real use loads a config file, a pretrained cluster-embedding file, and a
//! checkpoint; this example fabricates a tiny cluster file so it runs
//! standalone.

use lbert::prelude::*;
use std::io::Write;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut config = BertConfig::new(1000, 64);
    config.hidden_size = 64;
    config.num_attention_heads = 4;
    config.intermediate_size = 128;
    config.num_hidden_layers = 2;

    let cluster_path = std::env::temp_dir().join("lbert_example_clusters.tsv");
    let mut file = std::fs::File::create(&cluster_path)?;
    for row in 0..config.cluster_size {
        let vector: Vec<String> = (0..config.hidden_size)
            .map(|col| format!("{:.4}", ((row + col) % 7) as f32 * 0.01))
            .collect();
        writeln!(file, "{row}\t{}", vector.join(","))?;
    }

    let encoder = Encoder::builder()
        .config(config)
        .cluster_embeddings(&cluster_path)
        .seed(42)
        .build()?;

    let encoding = encoder.encode(
        &[vec![31, 51, 99], vec![15, 5]],
        &[vec![7, 45, 34], vec![7, 18]],
    )?;

    for (row, pooled) in encoding.pooled.iter().enumerate() {
        println!("row {row}: pooled[..4] = {:?}", &pooled[..4]);
    }

    let _ = std::fs::remove_file(cluster_path);
    Ok(())
}
