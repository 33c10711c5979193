//! Checkpoint Persistence
//!
//! A checkpoint is everything needed to sample from a trained model: the
//! architecture, the vocabulary and every parameter tensor.
//!
//! ## File Layout
//!
//! ```text
//! "CHARLM_CKPT"                    11-byte magic
//! version                          u8 (currently 1)
//! len, ModelConfig as JSON         u32 LE + bytes
//! len, Vocabulary as JSON          u32 LE + bytes
//! tensor count                     u32 LE
//! per tensor:                      in model parameter order
//!     rank, dims[rank], len        u32 LE each
//!     data                         len × f32 LE
//! len, metadata as JSON            u32 LE + bytes
//! ```
//!
//! Next to each `<prefix>-iter000123.ckpt` a one-line sidecar
//! `<prefix>-iter000123.metrics` records `loss=<float>,perplexity=<float>`
//! when the checkpoint was written with evaluation metrics.
//!
//! ## Retention
//!
//! [`apply_retention`] keeps the `keep_last` most recent checkpoints of a
//! prefix and deletes older ones, but never the checkpoint holding the best
//! validation loss.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::metrics::EvaluationMetrics;
use crate::model::LanguageModel;
use crate::tensor::Tensor;
use crate::vocab::Vocabulary;

const MAGIC: &[u8; 11] = b"CHARLM_CKPT";
const VERSION: u8 = 1;
const EXTENSION: &str = "ckpt";
const METRICS_EXTENSION: &str = "metrics";

/// Training state recorded alongside the weights
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub iteration: usize,
    /// Most recent validation metrics at the time of writing, if any
    pub evaluation: Option<EvaluationMetrics>,
}

/// A checkpoint read back from disk
pub struct LoadedCheckpoint {
    pub model: LanguageModel,
    pub vocab: Vocabulary,
    pub metadata: CheckpointMetadata,
}

/// `<dir>/<prefix>-iter<iteration, 6 digits>.ckpt`
pub fn checkpoint_path(dir: &Path, prefix: &str, iteration: usize) -> PathBuf {
    dir.join(format!("{}-iter{:06}.{}", prefix, iteration, EXTENSION))
}

/// Sidecar metrics file for a checkpoint path
pub fn metrics_path(checkpoint: &Path) -> PathBuf {
    checkpoint.with_extension(METRICS_EXTENSION)
}

/// Write `model`, `vocab` and `metadata` to `path`, plus the metrics sidecar
pub fn save_checkpoint(
    path: &Path,
    model: &LanguageModel,
    vocab: &Vocabulary,
    metadata: &CheckpointMetadata,
) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);

    w.write_all(MAGIC)?;
    w.write_all(&[VERSION])?;
    write_json(&mut w, model.config())?;
    write_json(&mut w, vocab)?;

    let params = model.parameters();
    write_u32(&mut w, params.len())?;
    for tensor in params {
        write_tensor(&mut w, tensor)?;
    }

    write_json(&mut w, metadata)?;
    w.flush()?;

    if let Some(eval) = &metadata.evaluation {
        fs::write(
            metrics_path(path),
            format!("loss={},perplexity={}\n", eval.loss, eval.perplexity),
        )?;
    } else {
        // A sidecar left at this stem would describe other weights
        match fs::remove_file(metrics_path(path)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
    }

    debug!(path = %path.display(), iteration = metadata.iteration, "wrote checkpoint");
    Ok(())
}

/// Restore a model and vocabulary for generation
pub fn load_checkpoint(path: &Path) -> Result<LoadedCheckpoint> {
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 11];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Checkpoint(format!(
            "{} is not a checkpoint file",
            path.display()
        )));
    }
    let mut version = [0u8; 1];
    r.read_exact(&mut version)?;
    if version[0] != VERSION {
        return Err(Error::Checkpoint(format!(
            "unsupported checkpoint version {}",
            version[0]
        )));
    }

    let config: ModelConfig = read_json(&mut r)?;
    let vocab: Vocabulary = read_json(&mut r)?;
    if vocab.size() != config.vocab_size {
        return Err(Error::Checkpoint(format!(
            "vocabulary has {} symbols but the model expects {}",
            vocab.size(),
            config.vocab_size
        )));
    }

    // Initial values are overwritten below
    let mut model = LanguageModel::new(&config, &mut StdRng::seed_from_u64(0))?;
    let count = read_u32(&mut r)?;
    let mut params = model.parameters_mut();
    if count != params.len() {
        return Err(Error::Checkpoint(format!(
            "checkpoint has {} tensors, model expects {}",
            count,
            params.len()
        )));
    }
    for (i, param) in params.iter_mut().enumerate() {
        let tensor = read_tensor(&mut r)?;
        if tensor.shape != param.tensor.shape {
            return Err(Error::Checkpoint(format!(
                "tensor {} has shape {:?}, expected {:?}",
                i, tensor.shape, param.tensor.shape
            )));
        }
        *param.tensor = tensor;
    }

    let metadata: CheckpointMetadata = read_json(&mut r)?;
    info!(
        path = %path.display(),
        iteration = metadata.iteration,
        parameters = model.num_parameters(),
        "loaded checkpoint"
    );

    Ok(LoadedCheckpoint {
        model,
        vocab,
        metadata,
    })
}

/// Delete all but the `keep_last` newest `<prefix>` checkpoints in `dir`
///
/// `protect` (the best checkpoint) survives regardless of age. Sidecar
/// metrics files go with their checkpoint. `keep_last == 0` keeps
/// everything. Returns the deleted checkpoint paths.
pub fn apply_retention(
    dir: &Path,
    prefix: &str,
    keep_last: usize,
    protect: Option<&Path>,
) -> Result<Vec<PathBuf>> {
    if keep_last == 0 {
        return Ok(Vec::new());
    }

    let mut found = list_checkpoints(dir, prefix)?;
    found.sort_by_key(|(iteration, _)| std::cmp::Reverse(*iteration));

    let mut removed = Vec::new();
    for (_, path) in found.into_iter().skip(keep_last) {
        if protect == Some(path.as_path()) {
            continue;
        }
        fs::remove_file(&path)?;
        let sidecar = metrics_path(&path);
        if sidecar.exists() {
            fs::remove_file(&sidecar)?;
        }
        removed.push(path);
    }
    Ok(removed)
}

/// `(iteration, path)` for every `<prefix>-iterNNNNNN.ckpt` in `dir`
pub fn list_checkpoints(dir: &Path, prefix: &str) -> Result<Vec<(usize, PathBuf)>> {
    let stem_prefix = format!("{}-iter", prefix);
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        let iteration = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix(&stem_prefix))
            .and_then(|digits| digits.parse::<usize>().ok());
        if let Some(iteration) = iteration {
            found.push((iteration, path));
        }
    }
    Ok(found)
}

fn write_u32<W: Write>(w: &mut W, value: usize) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| Error::Checkpoint(format!("value {} does not fit in u32", value)))?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u32<R: Read>(r: &mut R) -> Result<usize> {
    let mut bytes = [0u8; 4];
    r.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes) as usize)
}

fn write_json<W: Write, T: Serialize + ?Sized>(w: &mut W, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    write_u32(w, bytes.len())?;
    w.write_all(&bytes)?;
    Ok(())
}

fn read_json<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let len = read_u32(r)?;
    let bytes = read_bytes(r, len)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Read exactly `len` bytes; the buffer grows with the data actually read,
/// not with the length field.
fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    r.by_ref().take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(Error::Checkpoint(format!(
            "truncated section: expected {} bytes, found {}",
            len,
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn write_tensor<W: Write>(w: &mut W, tensor: &Tensor) -> Result<()> {
    write_u32(w, tensor.shape.len())?;
    for &dim in &tensor.shape {
        write_u32(w, dim)?;
    }
    write_u32(w, tensor.data.len())?;
    for &v in &tensor.data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_tensor<R: Read>(r: &mut R) -> Result<Tensor> {
    let rank = read_u32(r)?;
    let mut shape = Vec::with_capacity(rank);
    for _ in 0..rank {
        shape.push(read_u32(r)?);
    }
    let len = read_u32(r)?;
    if shape.iter().product::<usize>() != len {
        return Err(Error::Checkpoint(format!(
            "tensor of shape {:?} cannot hold {} values",
            shape, len
        )));
    }

    let byte_len = len
        .checked_mul(4)
        .ok_or_else(|| Error::Checkpoint(format!("tensor length {} overflows", len)))?;
    let bytes = read_bytes(r, byte_len)?;
    let data = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Tensor::new(data, shape))
}
