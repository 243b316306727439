//! Datasets named in the configuration.
//!
//! A description is either `dummy:<input_dim>,<output_dim>,<num_seqs>,<seq_len>`
//! or the path of a persisted dataset file.

use kairo_core::data::{Dataset, DummyDataset, FileDataset, SeqOrdering};
use kairo_core::{Config, KairoError, Result};

const DUMMY_PREFIX: &str = "dummy:";

fn dummy(args: &str) -> Result<DummyDataset> {
    let dims = args
        .split(',')
        .map(|s| s.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| KairoError::config(format!("bad dummy dataset {args:?}")))?;
    let &[input_dim, output_dim, num_seqs, seq_len] = dims.as_slice() else {
        return Err(KairoError::config(format!(
            "dummy dataset takes input_dim,output_dim,num_seqs,seq_len; got {args:?}"
        )));
    };
    Ok(DummyDataset::new(input_dim, output_dim, num_seqs, seq_len))
}

/// Opens the dataset described by `desc`, ordered by `seq_ordering`.
pub fn open_dataset(desc: &str, config: &Config) -> Result<Box<dyn Dataset>> {
    let ordering = SeqOrdering::from_config(config)?;
    let seed = config.int("random_seed", 42)? as u64;
    Ok(match desc.strip_prefix(DUMMY_PREFIX) {
        Some(args) => Box::new(dummy(args)?.with_ordering(ordering, seed)),
        None => Box::new(FileDataset::open(desc)?.with_ordering(ordering, seed)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_description() {
        let dataset = open_dataset("dummy:2,3,4,5", &Config::new()).unwrap();
        assert_eq!(dataset.num_seqs(), 4);
        assert_eq!(dataset.data_spec("data").unwrap().dim, 2);
        assert_eq!(dataset.seq_length(0, "classes").unwrap(), 5);
    }

    #[test]
    fn malformed_descriptions() {
        assert!(matches!(
            open_dataset("dummy:2,3", &Config::new()),
            Err(KairoError::Config(_))
        ));
        assert!(matches!(
            open_dataset("dummy:a,b,c,d", &Config::new()),
            Err(KairoError::Config(_))
        ));
        assert!(matches!(
            open_dataset("/nonexistent/data.safetensors", &Config::new()),
            Err(KairoError::Io { .. })
        ));
    }
}
