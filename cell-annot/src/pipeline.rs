use crate::annotate::{annotate_cell_types, cluster_cells, label_counts};
use crate::backend::Backend;
use crate::cleanup::{add_coarse_labels, remove_labels};
use crate::figures::{FigureWriter, TOTAL_COUNTS_VMAX};
use crate::markers::MarkerTable;
use crate::plan::{AnnotationPlan, SubclusterRound};
use crate::pseudobulk::{pseudobulk, PseudoBulk};
use crate::subcluster::{recompute_embedding, refine_and_integrate, reprocess_subset, UMAP_KEY};
use adata_types::AnnMatrix;
use anyhow::{Context, Error};
use itertools::Itertools;
use log::info;

/// obs column plotted against the clip at [`TOTAL_COUNTS_VMAX`]
const TOTAL_COUNTS: &str = "total_counts";

/// What a run did, for reporting
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Cells in the input
    pub cells_in: usize,
    /// Cells dropped by the exclusion list
    pub cells_removed: usize,
    /// Clusters of the global clustering
    pub clusters: usize,
    /// Cells per final label, largest first
    pub label_counts: Vec<(String, usize)>,
    /// Cells per coarse label, largest first
    pub coarse_counts: Vec<(String, usize)>,
}

/// Annotate `adata` in place following `plan`: cluster, report the inspected clusters, label the
/// clusters, refine each compartment of the plan, drop excluded labels, re-embed and add coarse
/// labels. Figures are written when `figures` is given.
pub fn run(
    adata: &mut AnnMatrix,
    backend: &dyn Backend,
    markers: &MarkerTable,
    plan: &AnnotationPlan,
    figures: Option<&FigureWriter>,
) -> Result<RunSummary, Error> {
    plan.validate()?;
    let cells_in = adata.n_obs();
    let markers = markers.genes_present(adata);
    info!("annotating {cells_in} cells with {} marker genes", markers.genes().len());

    info!("clustering");
    let clusters = cluster_cells(adata, backend, &plan.global_clustering())?;
    let pb = pseudobulk(adata, &[plan.sample_key.as_str(), plan.cluster_key.as_str()])?;

    if let Some(figures) = figures {
        if !adata.obsm.contains_key(UMAP_KEY) {
            recompute_embedding(adata, backend, &plan.use_rep, plan.n_neighbors, plan.seed)?;
        }
        figures.categorical("umap_leiden", adata, &plan.cluster_key)?;
        figures.marker_overview("umap_markers", adata, &markers)?;
    }
    if !plan.inspect_clusters.is_empty() {
        inspect_clusters(&pb, backend, plan, figures)?;
    }

    info!("annotating clusters");
    annotate_cell_types(adata, &plan.mapping, &plan.cluster_key, &plan.label_key)?;

    for round in &plan.rounds {
        info!("subclustering '{}' at resolution {}", round.target, round.resolution);
        *adata = refine_and_integrate(
            adata,
            &plan.label_key,
            |l| l == round.target,
            |subset| refine(subset, backend, &markers, plan, round, figures),
        )
        .with_context(|| format!("refining '{}'", round.target))?;
    }

    info!("removing {:?}", plan.exclude);
    let before = adata.n_obs();
    *adata = remove_labels(adata, &plan.label_key, &plan.exclude)?;
    let cells_removed = before - adata.n_obs();
    recompute_embedding(adata, backend, &plan.use_rep, plan.n_neighbors, plan.seed)?;

    add_coarse_labels(adata, &plan.label_key, &plan.coarse_key, &plan.coarse_rules)?;
    if let Some(figures) = figures {
        figures.categorical("umap_cell_type", adata, &plan.label_key)?;
        figures.categorical("umap_cell_type_coarse", adata, &plan.coarse_key)?;
        figures.dotplot("dotplot_cell_type", adata, &markers, &plan.label_key)?;
    }

    Ok(RunSummary {
        cells_in,
        cells_removed,
        clusters,
        label_counts: label_counts(adata, &plan.label_key)?,
        coarse_counts: label_counts(adata, &plan.coarse_key)?,
    })
}

fn inspect_clusters(
    pb: &PseudoBulk,
    backend: &dyn Backend,
    plan: &AnnotationPlan,
    figures: Option<&FigureWriter>,
) -> Result<(), Error> {
    let groups: Vec<String> = plan.inspect_clusters.iter().map(ToString::to_string).collect();
    let ranked = pb
        .rank_genes(backend, &plan.cluster_key, &groups, plan.n_top_genes)
        .with_context(|| format!("ranking genes of clusters {groups:?}"))?;
    info!(
        "top genes of clusters {groups:?}: {}",
        ranked
            .iter()
            .take(10)
            .map(|r| format!("{} ({:.2})", r.gene, r.mean_log_expression))
            .join(", ")
    );
    if let Some(figures) = figures {
        if !ranked.is_empty() {
            let title = format!("{} {} vs rest", plan.cluster_key, groups.join(", "));
            figures.ranked_genes(&format!("rank_genes_{}", groups.join("_")), &title, &ranked)?;
        }
    }
    Ok(())
}

/// Work done on one compartment's independent copy.
fn refine(
    subset: &mut AnnMatrix,
    backend: &dyn Backend,
    markers: &MarkerTable,
    plan: &AnnotationPlan,
    round: &SubclusterRound,
    figures: Option<&FigureWriter>,
) -> Result<(), Error> {
    reprocess_subset(subset, backend, &plan.round_clustering(round))?;
    if let Some(figures) = figures {
        let prefix: String = round.target.split_whitespace().join("_");
        figures.dotplot(&format!("dotplot_{prefix}"), subset, markers, &plan.cluster_key)?;
        figures.marker_overview(&format!("umap_{prefix}_markers"), subset, &markers.filter(&round.marker_filter))?;
        if subset.obs.get(TOTAL_COUNTS).is_some() {
            let totals = subset.obs_numeric(TOTAL_COUNTS)?;
            figures.numeric(
                &format!("umap_{prefix}_{TOTAL_COUNTS}"),
                subset,
                TOTAL_COUNTS,
                &totals,
                Some(TOTAL_COUNTS_VMAX),
            )?;
        }
        figures.categorical(&format!("umap_{prefix}_leiden"), subset, &plan.cluster_key)?;
    }
    annotate_cell_types(subset, &round.mapping, &plan.cluster_key, &plan.label_key)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cleanup::CoarseRule;
    use crate::mapping::LabelMapping;
    use crate::test_util::{blobs, FakeBackend};

    // blobs of 11, 10, 9, 8, 7 and 6 cells become clusters 0..6 in that order; with 5 neighbors
    // every blob is one connected component
    fn plan() -> AnnotationPlan {
        AnnotationPlan {
            resolution: 1.0,
            n_neighbors: 5,
            seed: 0,
            cluster_key: "leiden".into(),
            label_key: "cell_type".into(),
            coarse_key: "cell_type_coarse".into(),
            sample_key: "patient_id".into(),
            use_rep: "X_scVI".into(),
            inspect_clusters: vec![5],
            n_top_genes: 3,
            mapping: LabelMapping::new([
                ("Hepatocytes", vec![0]),
                ("lymphoid", vec![1, 4]),
                ("myeloid", vec![2, 3]),
                ("Erythrocytes", vec![5]),
            ]),
            rounds: vec![
                SubclusterRound {
                    target: "myeloid".into(),
                    resolution: 0.3,
                    n_neighbors: 5,
                    marker_filter: vec!["Macro".into()],
                    mapping: LabelMapping::new([("Macrophages", vec![0]), ("potentially empty droplets", vec![1])]),
                },
                SubclusterRound {
                    target: "lymphoid".into(),
                    resolution: 0.5,
                    n_neighbors: 5,
                    marker_filter: vec![],
                    mapping: LabelMapping::new([("T cells CD8", vec![0]), ("T cells CD4", vec![1])]),
                },
            ],
            exclude: vec!["potentially empty droplets".into(), "Erythrocytes".into()],
            coarse_rules: vec![CoarseRule::new("T cells", "T cells")],
        }
    }

    fn markers() -> MarkerTable {
        MarkerTable::new(vec![
            ("Hepatocytes".into(), "ALB".into()),
            ("Macrophages".into(), "LYZ".into()),
            ("T cells".into(), "CD3E".into()),
            ("Kupffer cells".into(), "MARCO".into()),
        ])
    }

    #[test]
    fn test_run() {
        let mut adata = blobs(&[11, 10, 9, 8, 7, 6]);
        let names = adata.obs_names.clone();
        let summary = run(&mut adata, &FakeBackend, &markers(), &plan(), None).unwrap();

        assert_eq!(summary.cells_in, 51);
        assert_eq!(summary.clusters, 6);
        // blob of 8 (empty droplets) and blob of 6 (erythrocytes) are gone
        assert_eq!(summary.cells_removed, 14);
        assert_eq!(adata.n_obs(), 37);
        let kept: Vec<&String> = names[..30].iter().chain(&names[38..45]).collect();
        assert_eq!(adata.obs_names.iter().collect::<Vec<_>>(), kept);

        let labels = adata.obs_labels("cell_type").unwrap();
        assert!(labels[..11].iter().all(|&l| l == "Hepatocytes"));
        assert!(labels[11..21].iter().all(|&l| l == "T cells CD8"));
        assert!(labels[21..30].iter().all(|&l| l == "Macrophages"));
        assert!(labels[30..].iter().all(|&l| l == "T cells CD4"));
        let coarse = adata.obs_labels("cell_type_coarse").unwrap();
        assert_eq!(coarse.iter().filter(|&&l| l == "T cells").count(), 17);

        // global cluster ids survive the subclustering rounds
        let leiden = adata.obs_labels("leiden").unwrap();
        assert_eq!(leiden[0], "0");
        assert_eq!(leiden[36], "4");
        assert_eq!(adata.obsm[UMAP_KEY].nrows(), 37);
        assert_eq!(
            summary.label_counts,
            vec![
                ("Hepatocytes".to_string(), 11),
                ("T cells CD8".to_string(), 10),
                ("Macrophages".to_string(), 9),
                ("T cells CD4".to_string(), 7),
            ]
        );
    }

    #[test]
    fn test_run_with_figures() {
        let dir = tempfile::tempdir().unwrap();
        let figures = FigureWriter::new(dir.path()).unwrap();
        let mut adata = blobs(&[11, 10, 9, 8, 7, 6]);
        run(&mut adata, &FakeBackend, &markers(), &plan(), Some(&figures)).unwrap();
        for name in ["umap_leiden", "umap_cell_type", "umap_cell_type_coarse", "dotplot_myeloid", "rank_genes_5"] {
            assert!(dir.path().join(format!("{name}.html")).exists(), "{name}");
        }
    }

    #[test]
    fn test_bad_mapping_aborts() {
        let mut adata = blobs(&[11, 10, 9, 8, 7, 6]);
        let mut bad = plan();
        bad.mapping = LabelMapping::new([("Hepatocytes", vec![0, 1, 2, 3, 4])]);
        assert!(run(&mut adata, &FakeBackend, &markers(), &bad, None).is_err());
    }

    #[test]
    fn test_unknown_inspected_cluster_aborts() {
        let mut adata = blobs(&[11, 10, 9, 8, 7, 6]);
        let mut bad = plan();
        bad.inspect_clusters = vec![99];
        let err = run(&mut adata, &FakeBackend, &markers(), &bad, None).unwrap_err();
        assert!(format!("{err:#}").contains("ranking genes of clusters [\"99\"]"));
        assert!(adata.obs.get("cell_type").is_none());
    }
}
