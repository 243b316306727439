//! # Persisted Dataset File
//!
//! A safetensors container holding a whole corpus of frames:
//!
//! | tensor | dtype | shape |
//! |---|---|---|
//! | `inputs` | f32 | `(num_timesteps, dim)` |
//! | `seqLengths` | i64 | `(num_seqs, 2)`: input and target length |
//! | `seqTags` | u8 | `(num_seqs, max_tag_len)`, zero-padded UTF-8 |
//! | `targets` | u32 | `(num_target_frames,)`, optional |
//!
//! Metadata: `inputPattSize`, `numSeqs`, `numTimesteps` and, when targets are
//! present, `numLabels`. Sequences are stored contiguously in insertion order.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use tracing::info;

use crate::data::dataset::{Dataset, Frames, OrderState, SeqOrdering};
use crate::data::extern_data::{DataSpec, DEFAULT_INPUT_KEY, DEFAULT_TARGET_KEY};
use crate::error::{KairoError, Result};

const INPUTS: &str = "inputs";
const SEQ_LENGTHS: &str = "seqLengths";
const SEQ_TAGS: &str = "seqTags";
const TARGETS: &str = "targets";

/// Accumulates sequences and writes them as one file.
#[derive(Debug, Clone)]
pub struct DatasetFileWriter {
    dim: usize,
    input_patt_size: usize,
    num_labels: Option<usize>,
    inputs: Vec<f32>,
    targets: Vec<u32>,
    lengths: Vec<(usize, usize)>,
    tags: Vec<String>,
}

impl DatasetFileWriter {
    /// `dim` is the width of the stored frames; `input_patt_size` is recorded
    /// as the `inputPattSize` attribute. No targets are stored unless
    /// [`DatasetFileWriter::with_targets`] is called.
    pub fn new(dim: usize, input_patt_size: usize) -> Self {
        Self {
            dim,
            input_patt_size,
            num_labels: None,
            inputs: Vec::new(),
            targets: Vec::new(),
            lengths: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Declares that sequences carry targets over `num_labels` classes.
    pub fn with_targets(mut self, num_labels: usize) -> Self {
        self.num_labels = Some(num_labels);
        self
    }

    /// Appends one sequence. `frames` is row-major `(time, dim)`.
    pub fn add_seq(&mut self, tag: &str, frames: &[f32], targets: Option<&[u32]>) -> Result<()> {
        if self.dim == 0 || frames.len() % self.dim != 0 {
            return Err(KairoError::data(format!(
                "sequence {tag:?}: {} values are not a multiple of dim {}",
                frames.len(),
                self.dim
            )));
        }
        let target_len = match (self.num_labels, targets) {
            (Some(_), Some(t)) => {
                self.targets.extend_from_slice(t);
                t.len()
            }
            (None, None) => 0,
            (Some(_), None) => {
                return Err(KairoError::data(format!("sequence {tag:?} lacks targets")));
            }
            (None, Some(_)) => {
                return Err(KairoError::data("writer was not created with targets"));
            }
        };
        self.inputs.extend_from_slice(frames);
        self.lengths.push((frames.len() / self.dim, target_len));
        self.tags.push(tag.to_string());
        Ok(())
    }

    /// Number of sequences added so far.
    pub fn num_seqs(&self) -> usize {
        self.tags.len()
    }

    /// Serializes all sequences.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let num_seqs = self.tags.len();
        let num_timesteps = self.inputs.len() / self.dim.max(1);

        let inputs: Vec<u8> = self.inputs.iter().flat_map(|v| v.to_le_bytes()).collect();
        let lengths: Vec<u8> = self
            .lengths
            .iter()
            .flat_map(|&(a, b)| [a as i64, b as i64])
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let max_tag_len = self.tags.iter().map(String::len).max().unwrap_or(0);
        let mut tags = vec![0u8; num_seqs * max_tag_len];
        for (i, tag) in self.tags.iter().enumerate() {
            tags[i * max_tag_len..i * max_tag_len + tag.len()].copy_from_slice(tag.as_bytes());
        }
        let targets: Vec<u8> = self.targets.iter().flat_map(|v| v.to_le_bytes()).collect();

        let mut views = vec![
            (
                INPUTS,
                TensorView::new(Dtype::F32, vec![num_timesteps, self.dim], &inputs)?,
            ),
            (
                SEQ_LENGTHS,
                TensorView::new(Dtype::I64, vec![num_seqs, 2], &lengths)?,
            ),
            (
                SEQ_TAGS,
                TensorView::new(Dtype::U8, vec![num_seqs, max_tag_len], &tags)?,
            ),
        ];
        let mut metadata = HashMap::from([
            ("inputPattSize".to_string(), self.input_patt_size.to_string()),
            ("numSeqs".to_string(), num_seqs.to_string()),
            ("numTimesteps".to_string(), num_timesteps.to_string()),
        ]);
        if let Some(num_labels) = self.num_labels {
            views.push((
                TARGETS,
                TensorView::new(Dtype::U32, vec![self.targets.len()], &targets)?,
            ));
            metadata.insert("numLabels".to_string(), num_labels.to_string());
        }
        Ok(safetensors::serialize(views, &Some(metadata))?)
    }

    /// Writes the file atomically: a temporary sibling is renamed over
    /// `path` once complete.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        write_atomic(path, &self.to_bytes()?)?;
        info!(
            path = %path.display(),
            seqs = self.num_seqs(),
            "wrote dataset file"
        );
        Ok(())
    }
}

/// Writes `bytes` to a temporary sibling of `path` and renames it into place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = PathBuf::from(path);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    tmp.set_file_name(format!(".{file_name}.tmp"));
    if let Err(e) = fs::write(&tmp, bytes) {
        let _ = fs::remove_file(&tmp);
        return Err(KairoError::io(&tmp, e));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        KairoError::io(path, e)
    })
}

fn layout_error(msg: impl Into<String>) -> KairoError {
    KairoError::data(format!("bad dataset file layout: {}", msg.into()))
}

fn tensor<'a>(file: &'a SafeTensors<'a>, name: &str, dtype: Dtype) -> Result<TensorView<'a>> {
    let view = file
        .tensor(name)
        .map_err(|_| layout_error(format!("missing tensor {name:?}")))?;
    if view.dtype() != dtype {
        return Err(layout_error(format!(
            "tensor {name:?} has dtype {:?}, expected {dtype:?}",
            view.dtype()
        )));
    }
    Ok(view)
}

fn metadata_usize(metadata: &HashMap<String, String>, key: &str) -> Result<usize> {
    metadata
        .get(key)
        .ok_or_else(|| layout_error(format!("missing attribute {key:?}")))?
        .parse()
        .map_err(|_| layout_error(format!("attribute {key:?} is not an integer")))
}

/// A [`Dataset`] over a persisted dataset file, loaded into memory.
#[derive(Debug, Clone)]
pub struct FileDataset {
    dim: usize,
    input_patt_size: usize,
    num_labels: Option<usize>,
    inputs: Vec<f32>,
    targets: Vec<u32>,
    /// Per sequence: (input offset, input len, target offset, target len).
    offsets: Vec<(usize, usize, usize, usize)>,
    tags: Vec<String>,
    order: OrderState,
}

impl FileDataset {
    /// Reads and validates a file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| KairoError::io(path, e))?;
        Self::from_bytes(&bytes)
    }

    /// Parses file content.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let file = SafeTensors::deserialize(bytes)?;

        let inputs_view = tensor(&file, INPUTS, Dtype::F32)?;
        let &[num_timesteps, dim] = inputs_view.shape() else {
            return Err(layout_error("inputs must be 2-D"));
        };
        let inputs: Vec<f32> = inputs_view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let lengths_view = tensor(&file, SEQ_LENGTHS, Dtype::I64)?;
        let &[num_seqs, 2] = lengths_view.shape() else {
            return Err(layout_error("seqLengths must have shape (num_seqs, 2)"));
        };
        let lengths: Vec<i64> = lengths_view
            .data()
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();

        let tags_view = tensor(&file, SEQ_TAGS, Dtype::U8)?;
        let &[tag_rows, tag_width] = tags_view.shape() else {
            return Err(layout_error("seqTags must be 2-D"));
        };
        if tag_rows != num_seqs {
            return Err(layout_error("seqTags and seqLengths disagree on numSeqs"));
        }
        let tags = tags_view
            .data()
            .chunks(tag_width.max(1))
            .take(num_seqs)
            .map(|row| {
                let end = row.iter().position(|&b| b == 0).unwrap_or(row.len());
                String::from_utf8(row[..end].to_vec())
                    .map_err(|_| layout_error("sequence tag is not valid UTF-8"))
            })
            .collect::<Result<Vec<_>>>()?;
        let tags = if tag_width == 0 {
            vec![String::new(); num_seqs]
        } else {
            tags
        };

        let num_labels = match metadata.get("numLabels") {
            Some(_) => Some(metadata_usize(&metadata, "numLabels")?),
            None => None,
        };
        let targets: Vec<u32> = match num_labels {
            Some(_) => tensor(&file, TARGETS, Dtype::U32)?
                .data()
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            None => Vec::new(),
        };

        let mut offsets = Vec::with_capacity(num_seqs);
        let (mut input_offset, mut target_offset) = (0usize, 0usize);
        for pair in lengths.chunks_exact(2) {
            let (input_len, target_len) = (pair[0], pair[1]);
            if input_len < 0 || target_len < 0 {
                return Err(layout_error("negative sequence length"));
            }
            let (input_len, target_len) = (input_len as usize, target_len as usize);
            offsets.push((input_offset, input_len, target_offset, target_len));
            input_offset += input_len;
            target_offset += target_len;
        }
        if input_offset != num_timesteps || target_offset != targets.len() {
            return Err(layout_error("sequence lengths do not add up to the stored frames"));
        }
        if metadata_usize(&metadata, "numSeqs")? != num_seqs
            || metadata_usize(&metadata, "numTimesteps")? != num_timesteps
        {
            return Err(layout_error("attributes disagree with tensor shapes"));
        }

        let mut dataset = Self {
            dim,
            input_patt_size: metadata_usize(&metadata, "inputPattSize")?,
            num_labels,
            inputs,
            targets,
            offsets,
            tags,
            order: OrderState::default(),
        };
        dataset.init_seq_order(1)?;
        Ok(dataset)
    }

    /// Sets the ordering policy used by subsequent `init_seq_order` calls.
    pub fn with_ordering(mut self, ordering: SeqOrdering, seed: u64) -> Result<Self> {
        self.order.ordering = ordering;
        self.order.seed = seed;
        self.order.epoch = None;
        self.init_seq_order(1)?;
        Ok(self)
    }

    /// The `inputPattSize` attribute.
    pub fn input_patt_size(&self) -> usize {
        self.input_patt_size
    }

    fn entry(&self, seq_idx: usize) -> Result<(usize, usize, usize, usize)> {
        Ok(self.offsets[self.order.corpus_idx(seq_idx)?])
    }
}

impl Dataset for FileDataset {
    fn init_seq_order(&mut self, epoch: usize) -> Result<bool> {
        let lens: Vec<usize> = self.offsets.iter().map(|o| o.1).collect();
        Ok(self.order.init(epoch, lens.len(), |i| lens[i]))
    }

    fn num_seqs(&self) -> usize {
        self.offsets.len()
    }

    fn data_keys(&self) -> Vec<String> {
        let mut keys = vec![DEFAULT_INPUT_KEY.to_string()];
        if self.num_labels.is_some() {
            keys.push(DEFAULT_TARGET_KEY.to_string());
        }
        keys
    }

    fn data_spec(&self, key: &str) -> Option<DataSpec> {
        match (key, self.num_labels) {
            (DEFAULT_INPUT_KEY, _) => Some(DataSpec::dense(key, self.dim)),
            (DEFAULT_TARGET_KEY, Some(n)) => Some(DataSpec::sparse(key, n)),
            _ => None,
        }
    }

    fn seq_length(&self, seq_idx: usize, key: &str) -> Result<usize> {
        let (_, input_len, _, target_len) = self.entry(seq_idx)?;
        match (key, self.num_labels) {
            (DEFAULT_INPUT_KEY, _) => Ok(input_len),
            (DEFAULT_TARGET_KEY, Some(_)) => Ok(target_len),
            _ => Err(KairoError::data(format!("unknown data key {key:?}"))),
        }
    }

    fn seq_tag(&self, seq_idx: usize) -> Result<String> {
        Ok(self.tags[self.order.corpus_idx(seq_idx)?].clone())
    }

    fn frames(&self, seq_idx: usize, key: &str) -> Result<Frames> {
        let (input_offset, input_len, target_offset, target_len) = self.entry(seq_idx)?;
        match (key, self.num_labels) {
            (DEFAULT_INPUT_KEY, _) => Ok(Frames::Dense {
                values: self.inputs[input_offset * self.dim..(input_offset + input_len) * self.dim]
                    .to_vec(),
                dim: self.dim,
            }),
            (DEFAULT_TARGET_KEY, Some(_)) => Ok(Frames::Sparse(
                self.targets[target_offset..target_offset + target_len].to_vec(),
            )),
            _ => Err(KairoError::data(format!("unknown data key {key:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("kairo-file-{}-{name}", std::process::id()))
    }

    #[test]
    fn round_trip_preserves_lengths_tags_and_values() {
        let mut writer = DatasetFileWriter::new(2, 9).with_targets(3);
        writer
            .add_seq("utt-a", &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], Some(&[0, 2]))
            .unwrap();
        writer.add_seq("b", &[1.0, -1.0], Some(&[1])).unwrap();

        let path = temp_path("round-trip.safetensors");
        writer.write(&path).unwrap();
        let dataset = FileDataset::open(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(dataset.num_seqs(), 2);
        assert_eq!(dataset.input_patt_size(), 9);
        assert_eq!(dataset.seq_tag(0).unwrap(), "utt-a");
        assert_eq!(dataset.seq_tag(1).unwrap(), "b");
        assert_eq!(dataset.seq_length(0, "data").unwrap(), 3);
        assert_eq!(dataset.seq_length(0, "classes").unwrap(), 2);
        assert_eq!(
            dataset.frames(1, "data").unwrap(),
            Frames::Dense {
                values: vec![1.0, -1.0],
                dim: 2
            }
        );
        assert_eq!(dataset.frames(0, "classes").unwrap(), Frames::Sparse(vec![0, 2]));
        assert_eq!(dataset.num_timesteps().unwrap(), 4);
    }

    #[test]
    fn file_without_targets_has_only_inputs() {
        let mut writer = DatasetFileWriter::new(1, 1);
        writer.add_seq("x", &[0.5, 0.25], None).unwrap();
        let dataset = FileDataset::from_bytes(&writer.to_bytes().unwrap()).unwrap();
        assert_eq!(dataset.data_keys(), vec!["data".to_string()]);
        assert!(dataset.data_spec("classes").is_none());
        assert!(dataset.frames(0, "classes").is_err());
    }

    #[test]
    fn writer_rejects_ragged_frames() {
        let mut writer = DatasetFileWriter::new(3, 3);
        assert!(writer.add_seq("bad", &[1.0, 2.0], None).is_err());
        assert!(writer.add_seq("bad", &[1.0, 2.0, 3.0], Some(&[0])).is_err());
        assert_eq!(writer.num_seqs(), 0);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(FileDataset::from_bytes(b"not a safetensors file").is_err());
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let path = temp_path("atomic.bin");
        write_atomic(&path, b"payload").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"payload");
        let tmp = path.with_file_name(format!(
            ".{}.tmp",
            path.file_name().unwrap().to_string_lossy()
        ));
        assert!(!tmp.exists());
        fs::remove_file(&path).unwrap();
    }
}
