// ============================================================
// Layer 5 — Training Loop
// ============================================================
// One loop for every policy, using Burn's DataLoader and AdamW.
//
// Key Burn insight:
//   - Training runs on an AutodiffBackend for gradients
//   - model.valid() returns the policy on B::InnerBackend, so
//     validation batches are built for the inner backend too
//   - Checkpoints are written from the inner module; with EMA
//     enabled that is the averaged copy, not the raw weights
//
// Reference: Burn Book §5, Loshchilov & Hutter (2019) AdamW

use anyhow::Result;
use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamWConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};

use crate::data::{batcher::EpisodeBatcher, dataset::EpisodicDataset};
use crate::infra::{
    checkpoint::{BestCheckpoint, CheckpointManager, CheckpointTag},
    metrics::{EpochMetrics, MetricsLogger},
};
use crate::ml::{
    diffusion::ema::{EmaConfig, EmaModel},
    policy::Policy,
};

/// Optimisation settings of a run.
#[derive(Debug, Clone)]
pub struct TrainerSettings {
    pub num_epochs:   usize,
    pub batch_size:   usize,
    pub lr:           f64,
    pub weight_decay: f64,
    pub seed:         u64,
    /// Periodic checkpoint interval in epochs (0 disables)
    pub save_every:   usize,
    /// Track an exponential moving average of the weights
    pub ema:          Option<EmaConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingSummary {
    pub best:   BestCheckpoint,
    pub epochs: usize,
}

/// Running mean of named loss terms over an epoch.
#[derive(Debug, Default)]
struct LossMeans {
    sums:    Vec<(String, f64)>,
    batches: usize,
}

impl LossMeans {
    fn add(&mut self, values: Vec<(&'static str, f64)>) {
        if self.sums.is_empty() {
            self.sums = values.iter().map(|(n, _)| (n.to_string(), 0.0)).collect();
        }
        for ((_, sum), (_, v)) in self.sums.iter_mut().zip(values) {
            *sum += v;
        }
        self.batches += 1;
    }

    fn means(self) -> Vec<(String, f64)> {
        let n = self.batches.max(1) as f64;
        self.sums.into_iter().map(|(name, s)| (name, s / n)).collect()
    }
}

fn loss_of(terms: &[(String, f64)]) -> f64 {
    terms
        .iter()
        .find(|(n, _)| n == "loss")
        .map(|(_, v)| *v)
        .unwrap_or(f64::NAN)
}

pub fn train_policy<B, M>(
    mut model: M,
    settings:  &TrainerSettings,
    train:     EpisodicDataset,
    val:       EpisodicDataset,
    batcher:   EpisodeBatcher,
    ckpt:      &CheckpointManager,
    metrics:   &MetricsLogger,
    device:    &B::Device,
) -> Result<TrainingSummary>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Policy<B>,
    M::InnerModule: Policy<B::InnerBackend>,
{
    tracing::info!(
        "Training on {} episodes, validating on {} ({} parameters)",
        train.len(),
        val.len(),
        model.num_params()
    );
    let has_val = !val.is_empty();
    if !has_val {
        tracing::warn!("No validation episodes; best checkpoint is selected by training loss");
    }

    // ── AdamW optimiser ───────────────────────────────────────────────────────
    let mut optim = AdamWConfig::new()
        .with_weight_decay(settings.weight_decay as f32)
        .init::<B, M>();
    let mut ema: Option<EmaModel<B, M>> = settings.ema.as_ref().map(|cfg| cfg.init(&model));

    // ── Data loaders ──────────────────────────────────────────────────────────
    let train_loader = DataLoaderBuilder::<B, _, _>::new(batcher.clone())
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(1)
        .set_device(device.clone())
        .build(train);
    let val_loader = DataLoaderBuilder::<B::InnerBackend, _, _>::new(batcher)
        .batch_size(settings.batch_size)
        .num_workers(1)
        .set_device(device.clone())
        .build(val);

    let mut best = BestCheckpoint { epoch: 0, val_loss: f64::INFINITY };

    for epoch in 1..=settings.num_epochs {
        // ── Training phase ────────────────────────────────────────────────────
        let mut train_means = LossMeans::default();
        for batch in train_loader.iter() {
            let losses = model.forward_loss(&batch);
            train_means.add(losses.values());

            let grads = losses.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optim.step(settings.lr, model, grads);

            if let Some(ema) = ema.as_mut() {
                ema.step(&model);
            }
        }

        // ── Validation phase ──────────────────────────────────────────────────
        let eval_model = match &ema {
            Some(ema) => ema.averaged().clone(),
            None => model.valid(),
        };
        let mut val_means = LossMeans::default();
        if has_val {
            for batch in val_loader.iter() {
                val_means.add(eval_model.forward_loss(&batch).values());
            }
        }

        let record = EpochMetrics::new(epoch, train_means.means(), val_means.means());
        println!(
            "Epoch {:>4}/{} | train_loss={:.5} | val_loss={:.5}",
            epoch,
            settings.num_epochs,
            loss_of(&record.train),
            loss_of(&record.val),
        );
        metrics.log(&record)?;

        if record.is_improvement(best.val_loss) {
            best = BestCheckpoint { epoch, val_loss: record.selection_loss() };
            ckpt.save_model::<B::InnerBackend, _>(&eval_model, CheckpointTag::Best)?;
            ckpt.save_best(&best)?;
            tracing::info!("New best policy at epoch {} (loss {:.5})", epoch, best.val_loss);
        }
        if settings.save_every > 0 && epoch % settings.save_every == 0 {
            ckpt.save_model::<B::InnerBackend, _>(&eval_model, CheckpointTag::Epoch(epoch))?;
            tracing::info!("Checkpoint saved for epoch {}", epoch);
        }
    }

    let last = match &ema {
        Some(ema) => ema.averaged().clone(),
        None => model.valid(),
    };
    ckpt.save_model::<B::InnerBackend, _>(&last, CheckpointTag::Last)?;
    tracing::info!(
        "Training complete! Best loss {:.5} at epoch {}",
        best.val_loss,
        best.epoch
    );
    Ok(TrainingSummary { best, epochs: settings.num_epochs })
}
