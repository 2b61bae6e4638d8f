//! Crash-safe checkpoints of the full training state.
//!
//! Layout under the checkpoint directory:
//!
//! ```text
//! checkpoint.json           manifest naming the newest complete checkpoint
//! step-00000500/            one directory per saved step
//!     generator.mpk
//!     discriminator.mpk
//!     generator-ema.mpk
//!     optimizer-generator.mpk
//!     optimizer-discriminator.mpk
//! ```
//!
//! A step directory is written under a `.partial` name and renamed once
//! complete; the manifest is replaced afterwards, so it never points at a
//! half-written checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::AutodiffBackend,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GanError, Result};
use crate::model::architecture::{Discriminator, Generator};
use crate::model::training::{TrainingState, UpdateCounters};

const MANIFEST: &str = "checkpoint.json";
const GENERATOR: &str = "generator";
const DISCRIMINATOR: &str = "discriminator";
const GENERATOR_EMA: &str = "generator-ema";
const OPTIMIZER_G: &str = "optimizer-generator";
const OPTIMIZER_D: &str = "optimizer-discriminator";
const STEP_PREFIX: &str = "step-";
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    step: usize,
    directory: String,
    counters: UpdateCounters,
}

/// Result of looking for a checkpoint to resume from.
#[derive(Debug)]
pub enum LoadOutcome<T> {
    Loaded(T),
    NotFound,
    /// A manifest exists but the state behind it cannot be read.
    Corrupt(String),
}

impl<T> LoadOutcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LoadOutcome<U> {
        match self {
            LoadOutcome::Loaded(value) => LoadOutcome::Loaded(f(value)),
            LoadOutcome::NotFound => LoadOutcome::NotFound,
            LoadOutcome::Corrupt(reason) => LoadOutcome::Corrupt(reason),
        }
    }
}

type StateRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Debug, Clone)]
pub struct Checkpointer {
    dir: PathBuf,
    keep: usize,
}

impl Checkpointer {
    pub fn new(dir: PathBuf, keep: usize) -> Self {
        Self {
            dir,
            keep: keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `state` and point the manifest at it. A failed write is retried
    /// once before giving up; failing to remove old checkpoints only warns.
    pub fn save<B, OG, OD>(&self, state: &TrainingState<B, OG, OD>) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B>,
        OD: Optimizer<Discriminator<B>, B>,
    {
        fs::create_dir_all(&self.dir)?;
        let path = match self.write(state) {
            Ok(path) => path,
            Err(err) => {
                warn!("checkpoint at step {} failed, retrying: {err}", state.step);
                self.write(state).map_err(|err| {
                    GanError::checkpoint(format!("step {}: {err}", state.step))
                })?
            }
        };
        if let Err(err) = self.prune(&path) {
            warn!("could not remove old checkpoints in {}: {err}", self.dir.display());
        }
        Ok(path)
    }

    /// Newest checkpoint loaded on top of `template`, which supplies the
    /// module structure and optimizer types.
    pub fn load<B, OG, OD>(
        &self,
        template: &TrainingState<B, OG, OD>,
        device: &B::Device,
    ) -> LoadOutcome<TrainingState<B, OG, OD>>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B> + Clone,
        OD: Optimizer<Discriminator<B>, B> + Clone,
    {
        if !self.dir.join(MANIFEST).exists() {
            return LoadOutcome::NotFound;
        }
        match self.read(template, device) {
            Ok(state) => LoadOutcome::Loaded(state),
            Err(GanError::CheckpointCorrupt(reason)) => LoadOutcome::Corrupt(reason),
            Err(err) => LoadOutcome::Corrupt(err.to_string()),
        }
    }

    fn write<B, OG, OD>(&self, state: &TrainingState<B, OG, OD>) -> Result<PathBuf>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B>,
        OD: Optimizer<Discriminator<B>, B>,
    {
        let name = format!("{STEP_PREFIX}{:08}", state.step);
        let staging = self.dir.join(format!("{name}{PARTIAL_SUFFIX}"));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let recorder = StateRecorder::new();
        state
            .generator
            .clone()
            .save_file(staging.join(GENERATOR), &recorder)
            .map_err(|e| GanError::checkpoint(format!("generator: {e:?}")))?;
        state
            .discriminator
            .clone()
            .save_file(staging.join(DISCRIMINATOR), &recorder)
            .map_err(|e| GanError::checkpoint(format!("discriminator: {e:?}")))?;
        state
            .averaged_generator
            .clone()
            .save_file(staging.join(GENERATOR_EMA), &recorder)
            .map_err(|e| GanError::checkpoint(format!("averaged generator: {e:?}")))?;
        Recorder::<B>::record(&recorder, state.optimizer_g.to_record(), staging.join(OPTIMIZER_G))
            .map_err(|e| GanError::checkpoint(format!("generator optimizer: {e:?}")))?;
        Recorder::<B>::record(&recorder, state.optimizer_d.to_record(), staging.join(OPTIMIZER_D))
            .map_err(|e| GanError::checkpoint(format!("discriminator optimizer: {e:?}")))?;

        let target = self.dir.join(&name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&staging, &target)?;

        let manifest = Manifest {
            step: state.step,
            directory: name,
            counters: state.counters,
        };
        let tmp = self.dir.join(format!("{MANIFEST}.tmp"));
        fs::write(&tmp, serde_json::to_string_pretty(&manifest)?)?;
        fs::rename(&tmp, self.dir.join(MANIFEST))?;
        debug!(step = state.step, "checkpoint written");
        Ok(target)
    }

    fn read<B, OG, OD>(
        &self,
        template: &TrainingState<B, OG, OD>,
        device: &B::Device,
    ) -> Result<TrainingState<B, OG, OD>>
    where
        B: AutodiffBackend,
        OG: Optimizer<Generator<B>, B> + Clone,
        OD: Optimizer<Discriminator<B>, B> + Clone,
    {
        let contents = fs::read_to_string(self.dir.join(MANIFEST))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .map_err(|e| GanError::corrupt(format!("unreadable manifest: {e}")))?;
        let dir = self.dir.join(&manifest.directory);
        let recorder = StateRecorder::new();

        let generator = template
            .generator
            .clone()
            .load_file(dir.join(GENERATOR), &recorder, device)
            .map_err(|e| GanError::corrupt(format!("generator: {e:?}")))?;
        let discriminator = template
            .discriminator
            .clone()
            .load_file(dir.join(DISCRIMINATOR), &recorder, device)
            .map_err(|e| GanError::corrupt(format!("discriminator: {e:?}")))?;
        let averaged_generator = template
            .averaged_generator
            .clone()
            .load_file(dir.join(GENERATOR_EMA), &recorder, device)
            .map_err(|e| GanError::corrupt(format!("averaged generator: {e:?}")))?;
        let optimizer_g = template.optimizer_g.clone().load_record(
            Recorder::<B>::load(&recorder, dir.join(OPTIMIZER_G), device)
                .map_err(|e| GanError::corrupt(format!("generator optimizer: {e:?}")))?,
        );
        let optimizer_d = template.optimizer_d.clone().load_record(
            Recorder::<B>::load(&recorder, dir.join(OPTIMIZER_D), device)
                .map_err(|e| GanError::corrupt(format!("discriminator optimizer: {e:?}")))?,
        );

        Ok(TrainingState {
            generator,
            discriminator,
            averaged_generator,
            optimizer_g,
            optimizer_d,
            step: manifest.step,
            counters: manifest.counters,
        })
    }

    /// Drop all but the newest `keep` step directories and stale partials.
    /// `current` always survives.
    fn prune(&self, current: &Path) -> Result<()> {
        let mut complete = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_dir() || !name.starts_with(STEP_PREFIX) {
                continue;
            }
            if name.ends_with(PARTIAL_SUFFIX) {
                fs::remove_dir_all(&path)?;
            } else if path != current {
                complete.push(path);
            }
        }
        // Zero-padded names sort by step.
        complete.sort();
        let excess = (complete.len() + 1).saturating_sub(self.keep);
        for stale in &complete[..excess] {
            debug!("removing old checkpoint {}", stale.display());
            fs::remove_dir_all(stale)?;
        }
        Ok(())
    }
}
