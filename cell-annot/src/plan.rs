use crate::annotate::ClusterParams;
use crate::cleanup::CoarseRule;
use crate::mapping::{ClusterId, LabelMapping};
use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_resolution() -> f64 {
    1.0
}
fn default_n_neighbors() -> usize {
    15
}
fn default_subset_n_neighbors() -> usize {
    10
}
fn default_n_top_genes() -> usize {
    60
}
fn default_cluster_key() -> String {
    "leiden".into()
}
fn default_label_key() -> String {
    "cell_type".into()
}
fn default_coarse_key() -> String {
    "cell_type_coarse".into()
}
fn default_sample_key() -> String {
    "patient_id".into()
}
fn default_use_rep() -> String {
    "X_scVI".into()
}
fn default_exclude() -> Vec<String> {
    vec!["potentially empty droplets".into(), "Erythrocytes".into()]
}
fn default_coarse_rules() -> Vec<CoarseRule> {
    vec![CoarseRule::new("T cells", "T cells")]
}

/// One refinement of a compartment by subclustering.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubclusterRound {
    /// Label of the cells to refine
    pub target: String,
    /// Community-detection resolution on the subset
    pub resolution: f64,
    /// Neighbors per cell in the subset graph
    #[serde(default = "default_subset_n_neighbors")]
    pub n_neighbors: usize,
    /// Cell types whose markers are plotted, as name substrings
    #[serde(default)]
    pub marker_filter: Vec<String>,
    /// Labels of the subclusters
    pub mapping: LabelMapping,
}

/// All curated choices of an annotation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnnotationPlan {
    /// Resolution of the global clustering
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Neighbors per cell for graphs and embeddings of the full matrix
    #[serde(default = "default_n_neighbors")]
    pub n_neighbors: usize,
    /// Random seed for clustering and embedding
    #[serde(default)]
    pub seed: u64,
    /// obs column of cluster ids
    #[serde(default = "default_cluster_key")]
    pub cluster_key: String,
    /// obs column of cell-type labels
    #[serde(default = "default_label_key")]
    pub label_key: String,
    /// obs column of coarse labels
    #[serde(default = "default_coarse_key")]
    pub coarse_key: String,
    /// obs column identifying the sample (patient) for pseudobulk
    #[serde(default = "default_sample_key")]
    pub sample_key: String,
    /// obsm representation used for neighbor graphs and embeddings
    #[serde(default = "default_use_rep")]
    pub use_rep: String,
    /// Clusters whose up-regulated genes are reported before annotation
    #[serde(default)]
    pub inspect_clusters: Vec<ClusterId>,
    /// Genes reported for the inspected clusters
    #[serde(default = "default_n_top_genes")]
    pub n_top_genes: usize,
    /// Labels of the global clusters
    pub mapping: LabelMapping,
    /// Compartments refined by subclustering, in order
    #[serde(default)]
    pub rounds: Vec<SubclusterRound>,
    /// Labels whose cells are dropped at the end
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// Rules deriving the coarse label
    #[serde(default = "default_coarse_rules")]
    pub coarse_rules: Vec<CoarseRule>,
}

impl AnnotationPlan {
    /// Curated annotation of the liver dataset.
    pub fn liver() -> AnnotationPlan {
        AnnotationPlan {
            resolution: default_resolution(),
            n_neighbors: default_n_neighbors(),
            seed: 0,
            cluster_key: default_cluster_key(),
            label_key: default_label_key(),
            coarse_key: default_coarse_key(),
            sample_key: default_sample_key(),
            use_rep: default_use_rep(),
            inspect_clusters: vec![25],
            n_top_genes: default_n_top_genes(),
            mapping: LabelMapping::new([
                ("B cells", vec![20]),
                ("Cholangiocytes", vec![26]),
                ("Endothelial cells", vec![15]),
                ("Hepatocytes", vec![18]),
                ("Plasma cells", vec![24]),
                ("Progenitor cells", vec![21, 17]),
                ("Mast cells", vec![27]),
                ("Neutrophils", vec![6, 2, 1, 10, 13, 11, 7, 12, 14]),
                ("myeloid", vec![22, 23, 0, 3]),
                ("NKT cells", vec![4, 19, 8, 9, 5, 16, 28]),
                ("Erythrocytes", vec![25]),
            ]),
            rounds: vec![
                SubclusterRound {
                    target: "myeloid".into(),
                    resolution: 0.3,
                    n_neighbors: 15,
                    marker_filter: vec!["Macro".into(), "mono".into(), "DC".into(), "div".into()],
                    mapping: LabelMapping::new([
                        ("cDCs", vec![6]),
                        ("pDCs", vec![7]),
                        ("Monocytes ⁄ Macrophages", vec![0, 1, 2, 3, 4]),
                        ("potentially empty droplets", vec![5]),
                    ]),
                },
                SubclusterRound {
                    target: "NKT cells".into(),
                    resolution: 0.5,
                    n_neighbors: default_subset_n_neighbors(),
                    marker_filter: vec!["div".into(), "T cell".into(), "NK".into()],
                    // 7 are dividing NK cells; 0 and 1/6 are NK subtypes, not told apart here
                    mapping: LabelMapping::new([
                        ("NK cells", vec![7, 0, 1, 6]),
                        ("T cells CD4", vec![3]),
                        ("NKT cells", vec![5]),
                        ("T cells CD8", vec![2, 4, 8]),
                        ("potentially empty droplets", vec![9]),
                    ]),
                },
            ],
            exclude: default_exclude(),
            coarse_rules: default_coarse_rules(),
        }
    }

    /// Read a plan from JSON
    pub fn load(path: impl AsRef<Path>) -> Result<AnnotationPlan, Error> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).with_context(|| path.display().to_string())?;
        let plan: AnnotationPlan =
            serde_json::from_str(&json).with_context(|| format!("parsing annotation plan {}", path.display()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Check every mapping and that each round refines a label of an earlier step.
    pub fn validate(&self) -> Result<(), Error> {
        self.mapping.validate().context("global mapping")?;
        let mut labels: Vec<&str> = self.mapping.labels().collect();
        for round in &self.rounds {
            round
                .mapping
                .validate()
                .with_context(|| format!("mapping of '{}'", round.target))?;
            if !labels.contains(&round.target.as_str()) {
                bail!("subclustering target '{}' is not assigned by an earlier step", round.target);
            }
            labels.extend(round.mapping.labels());
        }
        if self.n_neighbors == 0 || self.rounds.iter().any(|r| r.n_neighbors == 0) {
            bail!("neighbor counts must be positive");
        }
        Ok(())
    }

    /// Parameters of the global clustering
    pub fn global_clustering(&self) -> ClusterParams {
        ClusterParams {
            key: self.cluster_key.clone(),
            use_rep: self.use_rep.clone(),
            resolution: self.resolution,
            n_neighbors: self.n_neighbors,
            seed: self.seed,
        }
    }

    /// Parameters of the subclustering in `round`
    pub fn round_clustering(&self, round: &SubclusterRound) -> ClusterParams {
        ClusterParams {
            key: self.cluster_key.clone(),
            use_rep: self.use_rep.clone(),
            resolution: round.resolution,
            n_neighbors: round.n_neighbors,
            seed: self.seed,
        }
    }
}

impl Default for AnnotationPlan {
    fn default() -> Self {
        AnnotationPlan::liver()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_liver_plan() {
        let plan = AnnotationPlan::liver();
        plan.validate().unwrap();
        let global = plan.mapping.lookup().unwrap();
        assert_eq!(global[&25], "Erythrocytes");
        assert_eq!(global[&3], "myeloid");
        assert_eq!(plan.rounds[0].mapping.lookup().unwrap()[&5], "potentially empty droplets");
        assert_eq!(plan.rounds[1].n_neighbors, 10);
        assert_eq!(plan.round_clustering(&plan.rounds[0]).n_neighbors, 15);
        assert_eq!(plan.global_clustering().resolution, 1.0);
    }

    #[test]
    fn test_defaults_from_json() {
        let plan: AnnotationPlan = serde_json::from_str(
            r#"{"mapping": {"A": [0], "B": [1, 2]},
                "rounds": [{"target": "B", "resolution": 0.5, "mapping": {"B1": [0], "B2": [1]}}]}"#,
        )
        .unwrap();
        plan.validate().unwrap();
        assert_eq!(plan.cluster_key, "leiden");
        assert_eq!(plan.use_rep, "X_scVI");
        assert_eq!(plan.rounds[0].n_neighbors, 10);
        assert_eq!(plan.exclude, vec!["potentially empty droplets", "Erythrocytes"]);
        assert!(plan.inspect_clusters.is_empty());

        let json = serde_json::to_string(&AnnotationPlan::liver()).unwrap();
        let back: AnnotationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AnnotationPlan::liver());
    }

    #[test]
    fn test_invalid_plans() {
        let mut plan = AnnotationPlan::liver();
        plan.rounds[0].target = "Kupffer cells".into();
        assert!(plan.validate().is_err());

        let mut plan = AnnotationPlan::liver();
        plan.rounds[1].mapping = LabelMapping::new([("NK cells", vec![0]), ("T cells", vec![0])]);
        assert!(plan.validate().is_err());
    }
}
