//! affinyx: training entry points for binding-affinity models.

use std::path::{Path, PathBuf};

use affinyx_common::{
    ArchParams, Config, DataOpt, LigEdgeOpt, LigFeatOpt, ModelOpt, ProEdgeOpt, ProFeatOpt, RunConfig,
};
use affinyx_models::{LigandLmConfig, LigandLmEmbedder, ProteinLmConfig, ProteinLmEmbedder};
use affinyx_train::distributed::{self, DistributedArgs, DriverReport};
use affinyx_train::{AffinityDataset, DatasetSplits, SlurmEnv, Split};
use affinyx_tune::{SearchSpace, TrialRunner, Tuner, TunerConfig};
use anyhow::Context;
use candle_core::Device;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "affinyx", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Random hyperparameter search over the default GVPL_ESM space
    Tune {
        /// Number of trials (default 500)
        #[arg(long)]
        num_samples: Option<usize>,
    },
    /// Data-parallel training, one process per GPU under SLURM
    Dtrain(DtrainArgs),
    /// Precompute language model features for a split
    Embed {
        /// Which language model features to compute
        #[arg(long, value_enum, default_value = "protein")]
        lm: LmTarget,
        #[arg(long)]
        dataset: DataOpt,
        #[arg(long)]
        split: Split,
        /// Training fold; ignored for the test split
        #[arg(long)]
        fold: Option<u32>,
        #[arg(long, default_value = "nomsa")]
        feature_opt: ProFeatOpt,
        #[arg(long, default_value = "binary")]
        edge_opt: ProEdgeOpt,
        #[arg(long, default_value = "gvp")]
        ligand_feature_opt: LigFeatOpt,
        #[arg(long, default_value = "binary")]
        ligand_edge_opt: LigEdgeOpt,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LmTarget {
    /// Residue embeddings for ED/EDI/GVPL_ESM/CED protein graphs
    Protein,
    /// Pooled SELFIES embeddings for CD/CED ligands
    Ligand,
    All,
}

impl LmTarget {
    fn protein(self) -> bool {
        matches!(self, LmTarget::Protein | LmTarget::All)
    }

    fn ligand(self) -> bool {
        matches!(self, LmTarget::Ligand | LmTarget::All)
    }
}

#[derive(clap::Args, Debug)]
struct DtrainArgs {
    #[arg(long)]
    model_opt: ModelOpt,
    #[arg(long)]
    data_opt: DataOpt,
    #[arg(long, default_value = "nomsa")]
    feature_opt: ProFeatOpt,
    #[arg(long, default_value = "binary")]
    edge_opt: ProEdgeOpt,
    #[arg(long, default_value = "original")]
    ligand_feature_opt: LigFeatOpt,
    #[arg(long, default_value = "binary")]
    ligand_edge_opt: LigEdgeOpt,

    #[arg(long = "learning-rate", visible_alias = "lr", default_value_t = 1e-4)]
    learning_rate: f64,
    #[arg(short = 'D', long, default_value_t = 0.4)]
    dropout: f64,
    #[arg(long)]
    dropout_prot: Option<f64>,
    #[arg(long)]
    pro_emb_dim: Option<usize>,
    #[arg(short = 'E', long, default_value_t = 2000)]
    num_epochs: usize,
    #[arg(long, visible_alias = "fold")]
    fold_selection: Option<u32>,
    /// Per-process batch size; the global batch is this times the world size
    #[arg(long, visible_alias = "bs", default_value_t = 128)]
    batch_size: usize,
    #[arg(long)]
    protein_overlap: bool,

    /// Coordinator port (default from affinyx.toml)
    #[arg(long)]
    port: Option<u16>,
    /// Used when SLURM does not export SLURM_GPUS_ON_NODE
    #[arg(long)]
    gpus_per_node: Option<usize>,
    #[arg(long, default_value_t = 0)]
    rand_seed: u64,
}

impl DtrainArgs {
    fn into_distributed(self) -> DistributedArgs {
        let run = RunConfig {
            model: self.model_opt,
            dataset: self.data_opt,
            feature_opt: self.feature_opt,
            edge_opt: self.edge_opt,
            lig_feat_opt: self.ligand_feature_opt,
            lig_edge_opt: self.ligand_edge_opt,
            fold_selection: self.fold_selection,
            protein_overlap: self.protein_overlap,
            batch_size: self.batch_size,
            lr: self.learning_rate,
            epochs: self.num_epochs,
            arch: ArchParams {
                dropout: self.dropout,
                dropout_prot: self.dropout_prot,
                pro_emb_dim: self.pro_emb_dim,
                ..Default::default()
            },
            save_checkpoint: true,
        };
        DistributedArgs { run, port: self.port, gpus_per_node: self.gpus_per_node, rand_seed: self.rand_seed }
    }
}

fn init_tracing(rank: usize) {
    let default = if rank == 0 { "affinyx=info,warn" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let rank = match &cli.command {
        Commands::Dtrain(args) => SlurmEnv::from_env(args.gpus_per_node)
            .ok()
            .flatten()
            .map(|env| env.rank())
            .unwrap_or(0),
        _ => 0,
    };
    init_tracing(rank);
    info!("affinyx {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("loading affinyx.toml")?;

    match cli.command {
        Commands::Tune { num_samples } => tune(config, num_samples).await,
        Commands::Dtrain(args) => dtrain(config, args).await,
        Commands::Embed { lm, dataset, split, fold, feature_opt, edge_opt, ligand_feature_opt, ligand_edge_opt } => {
            let dir = config.layout().dataset_dir(dataset, feature_opt, edge_opt, ligand_feature_opt, ligand_edge_opt);
            embed(&config, dir, split, fold, lm).await
        }
    }
}

async fn tune(config: Config, num_samples: Option<usize>) -> anyhow::Result<()> {
    let layout = config.layout();
    let space = SearchSpace::default_space();
    let mut tuner_cfg = TunerConfig::new(format!("{}_{}", space.base.model, space.base.dataset), layout.tune_dir());
    if let Some(n) = num_samples {
        tuner_cfg.num_samples = n;
    }
    let seed = tuner_cfg.seed;

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let device = Device::cuda_if_available(0)?;
        let mut runner = TrialRunner::new(layout, device, seed);
        let exp = Tuner::new(space, tuner_cfg).fit(|ctx, cfg| runner.run(ctx, cfg))?;
        if let Some(best) = exp.best() {
            println!("{}", serde_json::to_string_pretty(best)?);
        }
        Ok(())
    })
    .await?
}

async fn dtrain(config: Config, args: DtrainArgs) -> anyhow::Result<()> {
    let args = args.into_distributed();
    let report = tokio::task::spawn_blocking(move || distributed::run(args, &config)).await??;
    finish(&report)
}

/// A rank whose run was aborted exits non-zero so the scheduler sees the failure.
fn finish(report: &DriverReport) -> anyhow::Result<()> {
    if report.aborted {
        anyhow::bail!(
            "rank {} aborted {} after {} epochs; no checkpoint or metrics were written",
            report.rank,
            report.model_key,
            report.epochs_run
        );
    }
    if report.rank == 0 {
        info!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

/// Source file for `embed`: the language-model split when an earlier run
/// already wrote it, so protein and ligand features can be added in turn.
fn embed_source(dir: &Path, split: Split, fold: Option<u32>) -> PathBuf {
    let existing = DatasetSplits::split_path(dir, split, fold, true);
    if existing.exists() {
        existing
    } else {
        DatasetSplits::split_path(dir, split, fold, false)
    }
}

async fn embed(config: &Config, dir: PathBuf, split: Split, fold: Option<u32>, lm: LmTarget) -> anyhow::Result<()> {
    let src = embed_source(&dir, split, fold);
    let dst = DatasetSplits::split_path(&dir, split, fold, true);
    let mut dataset =
        AffinityDataset::load(&src).with_context(|| format!("reading {}", src.display()))?;

    if lm.protein() {
        let lm_config = ProteinLmConfig::from(&config.hub);
        let batch_size = lm_config.batch_size;
        let embedder = ProteinLmEmbedder::new(lm_config).await?;
        info!("Embedding {} proteins with {}", dataset.len(), embedder.model_name());
        dataset = tokio::task::spawn_blocking(move || -> anyhow::Result<AffinityDataset> {
            dataset.attach_plm_features(batch_size, |seqs| Ok(embedder.embed_residues(seqs)?))?;
            Ok(dataset)
        })
        .await??;
    }
    if lm.ligand() {
        let lm_config = LigandLmConfig::from(&config.hub);
        let batch_size = lm_config.batch_size;
        let embedder = LigandLmEmbedder::new(lm_config).await?;
        info!("Embedding {} ligands with {}", dataset.len(), embedder.model_name());
        dataset = tokio::task::spawn_blocking(move || -> anyhow::Result<AffinityDataset> {
            dataset.attach_ligand_lm_features(batch_size, |smiles| Ok(embedder.embed_ligands(smiles)?))?;
            Ok(dataset)
        })
        .await??;
    }

    dataset.save(&dst).with_context(|| format!("writing {}", dst.display()))?;
    info!("Wrote {}", dst.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(aborted: bool) -> DriverReport {
        DriverReport {
            rank: 1,
            world_size: 2,
            model_key: "DGM_davis0D".into(),
            aborted,
            epochs_run: 3,
            test: None,
            val: None,
        }
    }

    #[test]
    fn test_aborted_run_is_a_failure() {
        let err = finish(&report(true)).unwrap_err();
        assert!(err.to_string().contains("rank 1 aborted DGM_davis0D"), "{err}");
        assert!(finish(&report(false)).is_ok());
    }

    #[test]
    fn test_embed_targets() {
        let cli = Cli::try_parse_from(["affinyx", "embed", "--lm", "all", "--dataset", "davis", "--split", "test"]).unwrap();
        let Commands::Embed { lm, .. } = cli.command else { panic!("expected embed") };
        assert!(lm.protein() && lm.ligand());

        let cli = Cli::try_parse_from(["affinyx", "embed", "--lm", "ligand", "--dataset", "davis", "--split", "test"]).unwrap();
        let Commands::Embed { lm, .. } = cli.command else { panic!("expected embed") };
        assert!(!lm.protein() && lm.ligand());
    }

    #[test]
    fn test_embed_builds_on_an_existing_language_model_split() {
        let tmp = tempfile::tempdir().unwrap();
        let plain = DatasetSplits::split_path(tmp.path(), Split::Test, None, false);
        assert_eq!(embed_source(tmp.path(), Split::Test, None), plain);

        let plm = DatasetSplits::split_path(tmp.path(), Split::Test, None, true);
        std::fs::write(&plm, "[]").unwrap();
        assert_eq!(embed_source(tmp.path(), Split::Test, None), plm);
    }

    #[test]
    fn test_dtrain_aliases() {
        let cli = Cli::try_parse_from([
            "affinyx", "dtrain", "--model-opt", "DG", "--data-opt", "davis", "--lr", "0.001", "--fold", "2", "--bs", "16",
        ])
        .unwrap();
        let Commands::Dtrain(args) = cli.command else { panic!("expected dtrain") };
        let run = args.into_distributed().run;
        assert_eq!(run.lr, 0.001);
        assert_eq!(run.fold_selection, Some(2));
        assert_eq!(run.batch_size, 16);
        assert!(run.save_checkpoint);
    }
}
