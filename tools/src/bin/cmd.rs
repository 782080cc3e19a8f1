// Command line utility for annotating cell types of an integrated h5ad

use anyhow::{Context, Error};
use cell_annot::{init_thread_pool, run, AnnotationPlan, FigureWriter, MarkerTable, ParamValues, Params};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use h5ad_io::{read_h5ad, write_h5ad_from};
use log::info;
use scan_backend::ScanBackend;
use std::fs::create_dir_all;
use std::path::PathBuf;

fn command() -> Command {
    Command::new("cell-annot-cmd")
        .about("Cluster, annotate and refine cell types of an integrated h5ad")
        .arg(
            Arg::new("PARAMS")
                .help("JSON file of run parameters (cpus, adata_path, artifact_dir, marker_genes_path)")
                .long("params")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("CPUS")
                .help("Worker threads")
                .long("cpus")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("ADATA")
                .help("Input h5ad")
                .long("adata")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("ARTIFACT_DIR")
                .help("Output directory")
                .long("artifact-dir")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("MARKERS")
                .help("Marker gene CSV with cell_type and gene_identifier columns")
                .long("markers")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("PLAN")
                .help("Annotation plan JSON; defaults to the built-in liver plan")
                .long("plan")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("NO_FIGURES")
                .help("Skip writing figures")
                .long("no-figures")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("SEED")
                .help("Random seed for clustering and embedding")
                .long("seed")
                .value_parser(value_parser!(u64)),
        )
}

fn resolve_params(matches: &ArgMatches) -> Result<Params, Error> {
    let source = matches
        .get_one::<PathBuf>("PARAMS")
        .map(ParamValues::load)
        .transpose()?;
    let mut overrides = ParamValues::default();
    overrides.cpus = matches.get_one::<usize>("CPUS").copied();
    overrides.adata_path = matches.get_one::<PathBuf>("ADATA").cloned();
    overrides.artifact_dir = matches.get_one::<PathBuf>("ARTIFACT_DIR").cloned();
    overrides.marker_genes_path = matches.get_one::<PathBuf>("MARKERS").cloned();
    Params::resolve(source.as_ref(), &overrides)
}

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = command().get_matches();

    let params = resolve_params(&matches)?;
    let budget = init_thread_pool(params.cpus)?;
    let backend = ScanBackend::new(budget);

    let markers = MarkerTable::load(&params.marker_genes_path)?;
    let mut plan = match matches.get_one::<PathBuf>("PLAN") {
        Some(path) => AnnotationPlan::load(path)?,
        None => AnnotationPlan::liver(),
    };
    if let Some(&seed) = matches.get_one::<u64>("SEED") {
        plan.seed = seed;
    }

    info!("reading {}", params.adata_path.display());
    let mut adata = read_h5ad(&params.adata_path)?;

    create_dir_all(&params.artifact_dir).with_context(|| params.artifact_dir.display().to_string())?;
    let figures = if matches.get_flag("NO_FIGURES") {
        None
    } else {
        Some(FigureWriter::new(params.figures_dir())?)
    };

    let summary = run(&mut adata, &backend, &markers, &plan, figures.as_ref())?;

    let output = params.output_path();
    write_h5ad_from(&adata, &params.adata_path, &output)?;
    info!(
        "wrote {} of {} cells in {} clusters to {}",
        adata.n_obs(),
        summary.cells_in,
        summary.clusters,
        output.display()
    );
    for (label, count) in &summary.label_counts {
        info!("  {label}: {count}");
    }
    Ok(())
}
