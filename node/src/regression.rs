//! The linear-regression job the node runs: artefacts built from the bundle, a training loop
//! checkpointing on rank 0 and an evaluation over the held-out set.

use std::sync::Arc;

use anyhow::{Context, bail};
use harness::{
    ArgBundle, Artefacts, Dataset, InMemoryDataset, Optimizer, OptimizerSource, SeededRngs,
    WorkerContext,
};
use log::info;
use rand::{Rng, rngs::StdRng};
use serde::Deserialize;
use serde_json::Value;

use crate::model::{GradientDescent, LinearRegression, Mse};

#[derive(Debug, Deserialize)]
struct ModelSpec {
    features: usize,
}

#[derive(Debug, Deserialize)]
struct DatasetSpec {
    samples: usize,
    #[serde(default)]
    test_samples: Option<usize>,
    #[serde(default)]
    noise: f32,
}

#[derive(Debug, Deserialize)]
struct OptimizerSpec {
    lr: f32,
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Deserialize)]
struct StepLrSpec {
    step_size: usize,
    gamma: f32,
}

fn parse<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> anyhow::Result<T> {
    serde_json::from_value(value.clone()).with_context(|| format!("invalid {what} entry"))
}

/// Builds the worker's artefacts from the argument bundle.
///
/// Every rank draws the same target line and samples from its seeded sources, the sampler then
/// hands each rank its own shard.
pub fn artefacts(bundle: &ArgBundle, rngs: &mut SeededRngs) -> anyhow::Result<Artefacts> {
    let model: ModelSpec = parse(&bundle.model, "model")?;
    let dataset: DatasetSpec = parse(&bundle.dataset, "dataset")?;
    let optimizer: OptimizerSpec = parse(&bundle.optimiser, "optimiser")?;

    if model.features == 0 {
        bail!("model.features must be greater than 0");
    }

    match bundle.loss_fn.as_str() {
        Some("mse") => {}
        other => bail!("unsupported loss function {other:?}"),
    }

    let target: Vec<f32> = (0..=model.features)
        .map(|_| rngs.general.random_range(-2.0..2.0))
        .collect();

    let train_set = synthesize(&target, dataset.samples, dataset.noise, &mut rngs.general)?;
    let test_samples = dataset.test_samples.unwrap_or(dataset.samples / 4).max(1);
    let test_set = synthesize(&target, test_samples, 0.0, &mut rngs.general)?;

    let mut artefacts = Artefacts::new(
        Box::new(LinearRegression::new(model.features, &mut rngs.numeric)),
        Arc::new(train_set),
        OptimizerSource::Live(Box::new(GradientDescent::new(optimizer.lr))),
        Box::new(Mse),
    )
    .with_test_set(Arc::new(test_set));

    if let Some(step) = &bundle.optimiser_step {
        let StepLrSpec { step_size, gamma } = parse(step, "optimiser_step")?;
        if step_size == 0 {
            bail!("optimiser_step.step_size must be greater than 0");
        }

        artefacts = artefacts.with_optimiser_step(Box::new(
            move |optimizer: &mut dyn Optimizer, epoch: usize| {
                if (epoch + 1) % step_size == 0 {
                    optimizer.set_learning_rate(optimizer.learning_rate() * gamma);
                }
            },
        ));
    }

    Ok(artefacts)
}

/// Samples `n` points of the line `target`, its last entry being the bias.
fn synthesize(
    target: &[f32],
    n: usize,
    noise: f32,
    rng: &mut StdRng,
) -> harness::Result<InMemoryDataset> {
    let (w, b) = target.split_at(target.len() - 1);
    let features = w.len();

    let xs: Vec<f32> = (0..n * features)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();

    let ys = xs
        .chunks_exact(features)
        .map(|x| {
            let y = x.iter().zip(w).map(|(x, w)| x * w).sum::<f32>() + b[0];
            if noise > 0.0 {
                y + rng.random_range(-noise..noise)
            } else {
                y
            }
        })
        .collect();

    InMemoryDataset::new(xs, ys, features, 1)
}

/// Trains from the job's first epoch, rank 0 saving the state every `save_every` epochs.
pub fn train(ctx: &mut WorkerContext) -> anyhow::Result<()> {
    for epoch in ctx.job.first_epoch()..ctx.job.epochs {
        let loss = ctx.replica.train_epoch(epoch)?;

        ctx.scalar("train/loss", epoch, loss)?;
        ctx.scalar("train/lr", epoch, ctx.replica.optimiser.learning_rate())?;

        if ctx.is_leader() {
            info!(epoch = epoch, loss = loss; "epoch finished");

            if ctx.job.should_save(epoch + 1) {
                ctx.save_state(epoch + 1)?;
            }
        }
    }

    Ok(())
}

/// Reports the replica's loss over the held-out set.
pub fn evaluate(ctx: &mut WorkerContext, held_out: Option<&dyn Dataset>) -> anyhow::Result<()> {
    let held_out = held_out.context("evaluation needs a held-out set")?;
    let loss = ctx.replica.evaluate(held_out);
    let step = ctx.job.first_epoch();

    ctx.scalar("eval/loss", step, loss)?;
    ctx.event(format_args!(
        "evaluated {} held-out samples at epoch {step}: loss {loss}",
        held_out.len()
    ))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use harness::SeedController;
    use serde_json::json;

    use super::*;

    fn bundle(extra: Value) -> ArgBundle {
        let mut value = json!({
            "model": { "features": 3 },
            "dataset": { "samples": 40, "test_samples": 10 },
            "optimiser": { "lr": 0.1 },
            "loss_fn": "mse",
            "epochs": 2,
            "ckpt_every": 1,
            "logdir": "./logs"
        });

        if let (Some(value), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            value.extend(extra.clone());
        }

        ArgBundle::from_value(value).unwrap()
    }

    #[test]
    fn builds_matching_artefacts_on_every_rank() {
        let build = || {
            let mut rngs = SeedController::new(3).seed_all(0);
            artefacts(&bundle(json!({})), &mut rngs).unwrap()
        };

        let (a, b) = (build(), build());

        assert_eq!(a.train_set.len(), 40);
        assert_eq!(a.train_set.x_size(), 3);
        assert_eq!(a.test_set.as_ref().map(|set| set.len()), Some(10));
        assert_eq!(a.model.params(), b.model.params());
        assert_eq!(a.train_set.sample(5).y, b.train_set.sample(5).y);
    }

    #[test]
    fn step_schedule_decays_the_learning_rate() {
        let mut rngs = SeedController::new(3).seed_all(0);
        let artefacts = artefacts(
            &bundle(json!({ "optimiser_step": { "step_size": 2, "gamma": 0.5 } })),
            &mut rngs,
        )
        .unwrap();

        let mut step = artefacts.optimiser_step.unwrap();
        let mut optimizer = GradientDescent::new(0.1);

        step(&mut optimizer, 0);
        assert_eq!(optimizer.learning_rate(), 0.1);
        step(&mut optimizer, 1);
        assert_eq!(optimizer.learning_rate(), 0.05);
    }

    #[test]
    fn unknown_loss_is_rejected() {
        let mut rngs = SeedController::new(3).seed_all(0);
        let err = artefacts(&bundle(json!({ "loss_fn": "hinge" })), &mut rngs).unwrap_err();

        assert!(err.to_string().contains("hinge"));
    }

    #[test]
    fn featureless_model_is_rejected() {
        let mut rngs = SeedController::new(3).seed_all(0);
        let featureless = bundle(json!({ "model": { "features": 0 } }));
        let err = artefacts(&featureless, &mut rngs).unwrap_err();

        assert!(err.to_string().contains("features"));
    }
}
