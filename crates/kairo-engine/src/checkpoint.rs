//! # Checkpoints
//!
//! One safetensors file per saved epoch, `<model>.<epoch:03>.safetensors`,
//! holding every parameter and the optimizer slots. The metadata carries the
//! format version, epoch, global step, learning rate and optimizer name.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use kairo_core::data::write_atomic;
use kairo_core::{KairoError, Result};
use safetensors::SafeTensors;
use tracing::{debug, info};

/// Version written into and required from every checkpoint.
pub const FORMAT_VERSION: u32 = 1;

const EXTENSION: &str = "safetensors";
const SLOT_PREFIX: &str = "optimizer:";

/// `<model>.<epoch:03>.safetensors`
pub fn checkpoint_path(model: &str, epoch: usize) -> PathBuf {
    PathBuf::from(format!("{model}.{epoch:03}.{EXTENSION}"))
}

/// `<model>.lr_control.json`
pub fn lr_control_path(model: &str) -> PathBuf {
    PathBuf::from(format!("{model}.lr_control.json"))
}

/// Epoch encoded in a checkpoint file name of `model`.
fn parse_epoch(file_name: &str, stem: &str) -> Option<usize> {
    let rest = file_name.strip_prefix(stem)?.strip_prefix('.')?;
    let epoch = rest.strip_suffix(EXTENSION)?.strip_suffix('.')?;
    if epoch.is_empty() || !epoch.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    epoch.parse().ok()
}

/// The newest checkpoint of `model` with an epoch no later than `max_epoch`.
pub fn find_latest(model: &str, max_epoch: usize) -> Result<Option<(usize, PathBuf)>> {
    let prefix = Path::new(model);
    let Some(stem) = prefix.file_name().map(|s| s.to_string_lossy().into_owned()) else {
        return Ok(None);
    };
    let dir = match prefix.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(KairoError::io(&dir, e)),
    };
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| KairoError::io(&dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(epoch) = parse_epoch(&name, &stem) else {
            continue;
        };
        if epoch > max_epoch || best.as_ref().is_some_and(|(e, _)| *e >= epoch) {
            continue;
        }
        best = Some((epoch, entry.path()));
    }
    Ok(best)
}

/// Everything needed to continue training after an epoch.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f64,
    pub optimizer: String,
    pub params: BTreeMap<String, Tensor>,
    pub slots: BTreeMap<String, Tensor>,
}

impl Checkpoint {
    /// Writes the checkpoint atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let metadata = HashMap::from([
            ("format_version".to_string(), FORMAT_VERSION.to_string()),
            ("epoch".to_string(), self.epoch.to_string()),
            ("global_step".to_string(), self.global_step.to_string()),
            ("learning_rate".to_string(), self.learning_rate.to_string()),
            ("optimizer".to_string(), self.optimizer.clone()),
        ]);
        let tensors: Vec<(String, &Tensor)> = self
            .params
            .iter()
            .map(|(name, t)| (name.clone(), t))
            .chain(self.slots.iter().map(|(name, t)| (name.clone(), t)))
            .collect();
        let bytes = safetensors::serialize(tensors, &Some(metadata))?;
        write_atomic(path, &bytes)?;
        info!(
            path = %path.display(),
            epoch = self.epoch,
            params = self.params.len(),
            "saved checkpoint"
        );
        Ok(())
    }

    /// Reads a checkpoint written by [`Checkpoint::save`].
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| KairoError::io(path, e))?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let field = |key: &str| {
            metadata.get(key).ok_or_else(|| {
                KairoError::data(format!("checkpoint {} lacks {key:?}", path.display()))
            })
        };
        let parse_err = |key: &str| {
            KairoError::data(format!("checkpoint {}: bad {key:?}", path.display()))
        };
        let version: u32 = field("format_version")?
            .parse()
            .map_err(|_| parse_err("format_version"))?;
        if version != FORMAT_VERSION {
            return Err(KairoError::data(format!(
                "checkpoint {} has format version {version}, expected {FORMAT_VERSION}",
                path.display()
            )));
        }
        let epoch = field("epoch")?.parse().map_err(|_| parse_err("epoch"))?;
        let global_step = field("global_step")?
            .parse()
            .map_err(|_| parse_err("global_step"))?;
        let learning_rate = field("learning_rate")?
            .parse()
            .map_err(|_| parse_err("learning_rate"))?;
        let optimizer = field("optimizer")?.clone();

        let mut params = BTreeMap::new();
        let mut slots = BTreeMap::new();
        for (name, tensor) in candle_core::safetensors::load_buffer(&bytes, device)? {
            if name.starts_with(SLOT_PREFIX) {
                slots.insert(name, tensor);
            } else {
                params.insert(name, tensor);
            }
        }
        debug!(path = %path.display(), epoch, "loaded checkpoint");
        Ok(Self {
            epoch,
            global_step,
            learning_rate,
            optimizer,
            params,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kairo-ckpt-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn file_names_carry_the_epoch() {
        assert_eq!(
            checkpoint_path("out/model", 7),
            PathBuf::from("out/model.007.safetensors")
        );
        assert_eq!(parse_epoch("model.012.safetensors", "model"), Some(12));
        assert_eq!(parse_epoch("model.lr_control.json", "model"), None);
        assert_eq!(parse_epoch("model2.001.safetensors", "model"), None);
    }

    #[test]
    fn latest_checkpoint_respects_the_epoch_limit() {
        let dir = scratch_dir("latest");
        let model = dir.join("model").to_string_lossy().into_owned();
        for epoch in [1, 2, 5] {
            fs::write(checkpoint_path(&model, epoch), b"").unwrap();
        }
        assert_eq!(find_latest(&model, 10).unwrap().unwrap().0, 5);
        assert_eq!(find_latest(&model, 4).unwrap().unwrap().0, 2);
        assert!(find_latest(&model, 0).unwrap().is_none());
        assert!(find_latest(&dir.join("missing/model").to_string_lossy(), 3).unwrap().is_none());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn save_then_load() {
        let dir = scratch_dir("io");
        let path = dir.join("model.003.safetensors");
        let w = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let m = Tensor::new(&[0.5f32, 0.25], &Device::Cpu).unwrap();
        let checkpoint = Checkpoint {
            epoch: 3,
            global_step: 12,
            learning_rate: 0.01,
            optimizer: "adam".to_string(),
            params: BTreeMap::from([("output/W".to_string(), w)]),
            slots: BTreeMap::from([("optimizer:m:output/b".to_string(), m)]),
        };
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.epoch, 3);
        assert_eq!(loaded.global_step, 12);
        assert_eq!(loaded.learning_rate, 0.01);
        assert_eq!(loaded.optimizer, "adam");
        assert_eq!(
            loaded.params["output/W"].to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 2.0], vec![3.0, 4.0]]
        );
        assert_eq!(loaded.slots.len(), 1);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = Checkpoint::load(Path::new("/nonexistent/model.001.safetensors"), &Device::Cpu);
        assert!(matches!(result, Err(KairoError::Io { .. })));
    }
}
