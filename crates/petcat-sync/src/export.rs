//! Parquet export of resolver output with a checksummed manifest.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use petcat_core::{Product, SimilarProductEdge};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ExportManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes `<reports_dir>/<run_id>/similar_products.parquet` and
/// `manifest.json`; returns the manifest path.
pub fn export_edges(
    reports_dir: &Path,
    run_id: Uuid,
    generated_at: DateTime<Utc>,
    snapshot: &[Product],
    edges: &[SimilarProductEdge],
) -> Result<PathBuf> {
    let run_dir = reports_dir.join(run_id.to_string());
    std::fs::create_dir_all(&run_dir).with_context(|| format!("creating {}", run_dir.display()))?;

    let edges_path = run_dir.join("similar_products.parquet");
    write_parquet(&edges_path, edges_batch(snapshot, edges)?)?;

    let manifest = ExportManifest {
        schema_version: 1,
        run_id,
        generated_at,
        files: vec![manifest_entry("similar_products", &run_dir, &edges_path, edges.len())?],
    };
    let manifest_path = run_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing export manifest")?;
    std::fs::write(&manifest_path, bytes).with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn edges_batch(snapshot: &[Product], edges: &[SimilarProductEdge]) -> Result<RecordBatch> {
    let names: HashMap<Uuid, &str> = snapshot.iter().map(|p| (p.id, p.name.as_str())).collect();
    let name_of = |id: &Uuid| names.get(id).copied();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("product_id", DataType::Utf8, false),
        ArrowField::new("product_name", DataType::Utf8, true),
        ArrowField::new("similar_product_id", DataType::Utf8, false),
        ArrowField::new("similar_product_name", DataType::Utf8, true),
        ArrowField::new("similarity", DataType::Float64, false),
        ArrowField::new("price_difference", DataType::Float64, false),
        ArrowField::new("price_ratio", DataType::Float64, false),
        ArrowField::new("updated_at", DataType::Utf8, false),
    ]));

    let product_ids = StringArray::from(edges.iter().map(|e| e.product_id.to_string()).collect::<Vec<_>>());
    let product_names = StringArray::from(edges.iter().map(|e| name_of(&e.product_id)).collect::<Vec<_>>());
    let similar_ids = StringArray::from(
        edges
            .iter()
            .map(|e| e.similar_product_id.to_string())
            .collect::<Vec<_>>(),
    );
    let similar_names = StringArray::from(
        edges
            .iter()
            .map(|e| name_of(&e.similar_product_id))
            .collect::<Vec<_>>(),
    );
    let similarities = Float64Array::from(edges.iter().map(|e| e.similarity).collect::<Vec<_>>());
    let differences = Float64Array::from(edges.iter().map(|e| e.price_difference).collect::<Vec<_>>());
    let ratios = Float64Array::from(edges.iter().map(|e| e.price_ratio).collect::<Vec<_>>());
    let updated = StringArray::from(edges.iter().map(|e| e.updated_at.to_rfc3339()).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(product_ids),
            Arc::new(product_names),
            Arc::new(similar_ids),
            Arc::new(similar_names),
            Arc::new(similarities),
            Arc::new(differences),
            Arc::new(ratios),
            Arc::new(updated),
        ],
    )
    .context("building similar_products record batch")
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path, rows: usize) -> Result<ExportManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(ExportManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
