//! One process of a data-parallel training run.
//!
//! Every rank runs [`run`] with the same arguments. Ranks meet at a barrier
//! after the model is loaded, after training, after the test pass and after
//! the validation pass; only rank 0 touches the checkpoint and the results
//! tables.

use std::time::Duration;

use affinyx_common::{Config, RunConfig};
use affinyx_models::checkpoint;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::Serialize;
use tracing::{error, info};

use crate::distributed::env::SlurmEnv;
use crate::distributed::group::{LocalGroup, ProcessGroup, TcpGroup};
use crate::error::{Result, TrainError};
use crate::metrics::{upsert_stats, RegressionMetrics, StatsRow};
use crate::saver::{resume_path, CheckpointSaver, Retention};
use crate::session::{load_splits, min_delta_for, RunSession, PATIENCE};
use crate::trainer::{RunOutcome, Trainer};

#[derive(Debug, Clone)]
pub struct DistributedArgs {
    pub run: RunConfig,
    /// Overrides `distributed.port` from the config file.
    pub port: Option<u16>,
    /// Used when `SLURM_GPUS_ON_NODE` is not exported.
    pub gpus_per_node: Option<usize>,
    pub rand_seed: u64,
}

/// What one rank did.
#[derive(Debug, Clone, Serialize)]
pub struct DriverReport {
    pub rank: usize,
    pub world_size: usize,
    pub model_key: String,
    pub aborted: bool,
    pub epochs_run: usize,
    pub test: Option<RegressionMetrics>,
    pub val: Option<RegressionMetrics>,
}

/// Copy every parameter from rank 0 to the other ranks, in name order.
pub fn broadcast_parameters(varmap: &VarMap, group: &dyn ProcessGroup) -> Result<()> {
    if group.world_size() <= 1 {
        return Ok(());
    }
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Group("parameter store lock poisoned".into()))?;
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();
    for name in names {
        let var = &data[name];
        let mut flat = var.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?;
        group.broadcast(&mut flat)?;
        let t = Tensor::from_vec(flat, var.dims(), var.device())?.to_dtype(var.dtype())?;
        var.set(&t)?;
    }
    Ok(())
}

fn join_group(args: &DistributedArgs, config: &Config) -> Result<(Box<dyn ProcessGroup>, usize)> {
    let Some(slurm) = SlurmEnv::from_env(args.gpus_per_node)? else {
        info!("No SLURM allocation found, training in a single process");
        return Ok((Box::new(LocalGroup), 0));
    };
    let port = args.port.unwrap_or(config.distributed.port);
    let (rank, world) = (slurm.rank(), slurm.world_size());
    info!("Rank {rank}/{world} joining {}", slurm.init_url(port));
    let timeout = Duration::from_secs(config.distributed.connect_timeout_secs);
    let group = TcpGroup::init(rank, world, slurm.coordinator(), port, timeout)?;
    Ok((Box::new(group), slurm.local_id))
}

/// Run one rank of the distributed training flow to completion.
pub fn run(args: DistributedArgs, config: &Config) -> Result<DriverReport> {
    let (group, local_id) = join_group(&args, config)?;
    let group = group.as_ref();
    let (rank, world) = (group.rank(), group.world_size());
    let is_main = group.is_main();

    let device = Device::cuda_if_available(local_id)?;
    // the CPU backend has no seedable generator; rank 0's weights are broadcast anyway
    if !device.is_cpu() {
        device.set_seed(args.rand_seed)?;
    }
    group.barrier()?;

    let cfg = args.run;
    let layout = config.layout();
    let key = cfg.model_key(world);
    let splits = load_splits(&layout, &cfg)?;
    let session = RunSession::new(cfg.clone(), splits, device.clone())?;
    let loaders = session.loaders(args.rand_seed, rank, world);

    let ckpt = layout.checkpoint_path(key.as_str());
    let mut saver = CheckpointSaver::new(
        session.varmap.clone(),
        &ckpt,
        min_delta_for(cfg.dataset),
        PATIENCE,
        Retention::Best,
        rank,
    )
    .with_provenance(key.as_str(), cfg.model);

    if is_main {
        layout.ensure_dirs()?;
        if let Some(path) = resume_path(&ckpt) {
            let meta = checkpoint::load_checkpoint(&path, &session.varmap, cfg.model, &device)?;
            info!("Resumed from {} (epoch {:?})", path.display(), meta.epoch);
        }
    }
    broadcast_parameters(&session.varmap, group)?;
    group.barrier()?;

    let mut trainer = Trainer::new(&session.model, &session.varmap, cfg.lr, device, group)?;
    let (outcome, log) = trainer.fit(&loaders.train, &loaders.val, cfg.epochs, Some(&mut saver), |r| {
        if is_main {
            info!(
                "epoch {}/{}: train {:.4}, val {:.4}",
                r.epoch + 1,
                cfg.epochs,
                r.train_loss,
                r.val_loss
            );
        }
    })?;

    let mut report = DriverReport {
        rank,
        world_size: world,
        model_key: key.to_string(),
        aborted: outcome.is_aborted(),
        epochs_run: log.epochs.len(),
        test: None,
        val: None,
    };
    if let RunOutcome::Aborted { epoch, error, .. } = &outcome {
        error!("Run {key} aborted at epoch {epoch}: {error}");
        return Ok(report);
    }
    group.barrier()?;
    saver.save()?;

    let test = trainer.predict(&loaders.test)?;
    group.barrier()?;
    if is_main {
        let m = RegressionMetrics::compute(&test.preds, &test.targets)?;
        info!("Test: {m:?}");
        upsert_stats(&layout.stats_csv(), StatsRow::new(key.as_str(), &m))?;
        report.test = Some(m);
    }

    let val = trainer.predict(&loaders.val)?;
    group.barrier()?;
    if is_main {
        let m = RegressionMetrics::compute(&val.preds, &val.targets)?;
        info!("Validation: {m:?}");
        upsert_stats(&layout.stats_csv_val(), StatsRow::new(key.as_str(), &m))?;
        report.val = Some(m);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_broadcast_is_noop_for_single_process() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints(3, "w", Init::Const(2.0)).unwrap();
        broadcast_parameters(&varmap, &LocalGroup).unwrap();
        let w = varmap.data().lock().unwrap()["w"].to_vec1::<f32>().unwrap();
        assert_eq!(w, vec![2.0; 3]);
    }
}
