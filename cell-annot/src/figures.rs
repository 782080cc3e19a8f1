use crate::markers::MarkerTable;
use crate::pseudobulk::RankedGene;
use crate::subcluster::UMAP_KEY;
use adata_types::AnnMatrix;
use anyhow::{bail, Context, Error};
use itertools::Itertools;
use log::{debug, warn};
use ndarray::Array2;
use plotly::color::Rgb;
use plotly::common::{Marker, Mode, Title};
use plotly::layout::Axis;
use plotly::{Bar, Layout, Plot, Scatter};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Upper clip of the total-counts color scale
pub const TOTAL_COUNTS_VMAX: f64 = 20000.0;

const CATEGORY_COLORS: [usize; 20] = [
    0x1f77b4, 0xff7f0e, 0x279e68, 0xd62728, 0xaa40fc, 0x8c564b, 0xe377c2, 0xb5bd61, 0x17becf, 0xaec7e8, 0xffbb78,
    0x98df8a, 0xff9896, 0xc5b0d5, 0xc49c94, 0xf7b6d2, 0xdbdb8d, 0x9edae5, 0xad494a, 0x8c6d31,
];

// inferno, dark to bright
const SEQUENTIAL_COLORS: [usize; 8] = [0x000004, 0x280b54, 0x65156e, 0x9f2a63, 0xd44842, 0xf57d15, 0xfac228, 0xfcffa4];

const POINT_SIZE: usize = 3;

fn hex_num_to_rgb(num: usize) -> Rgb {
    Rgb::new((num >> 16) as u8, ((num >> 8) & 0xFF) as u8, (num & 0xFF) as u8)
}

/// Bin of `value` on a scale from 0 to `max` split into `n_bins`; values above `max` fall in the
/// last bin.
fn bin(value: f64, max: f64, n_bins: usize) -> usize {
    if max <= 0.0 || value <= 0.0 {
        return 0;
    }
    (((value / max) * n_bins as f64) as usize).min(n_bins - 1)
}

/// Labels ordered numerically when they are cluster ids, alphabetically otherwise.
fn sorted_groups<'a>(labels: impl Iterator<Item = &'a str>) -> Vec<String> {
    labels
        .unique()
        .map(str::to_string)
        .sorted_by_key(|g| (g.parse::<u64>().ok(), g.clone()))
        .collect()
}

fn embedding_layout(title: &str) -> Layout {
    Layout::new()
        .title(Title::with_text(title))
        .height(600)
        .width(700)
        .x_axis(Axis::new().title(Title::with_text("UMAP1")).show_grid(false).zero_line(false))
        .y_axis(Axis::new().title(Title::with_text("UMAP2")).show_grid(false).zero_line(false))
}

/// Fraction of cells expressing each gene and its mean expression, per group.
#[derive(Clone, Debug, PartialEq)]
pub struct DotPlotStats {
    /// Group labels, rows of the matrices
    pub groups: Vec<String>,
    /// Genes, columns of the matrices
    pub genes: Vec<String>,
    /// Fraction of cells with non-zero expression
    pub fraction: Array2<f64>,
    /// Mean expression over all cells of the group
    pub mean: Array2<f64>,
}

/// Dot-plot statistics of `genes` over the groups of `obs[groupby]`. Genes absent from the matrix
/// are skipped.
pub fn dotplot_stats(adata: &AnnMatrix, genes: &[&str], groupby: &str) -> Result<DotPlotStats, Error> {
    let labels = adata.obs_labels(groupby)?;
    let groups = sorted_groups(labels.iter().copied());
    let position: HashMap<&str, usize> = groups.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect();
    let group_of: Vec<usize> = labels.iter().map(|l| position[l]).collect();
    let mut group_size = vec![0usize; groups.len()];
    for &g in &group_of {
        group_size[g] += 1;
    }

    let (found, missing): (Vec<_>, Vec<_>) = genes
        .iter()
        .unique()
        .map(|&g| (g, adata.var_position(g)))
        .partition(|(_, pos)| pos.is_some());
    if !missing.is_empty() {
        warn!("skipping genes not in the data: {}", missing.iter().map(|(g, _)| g).join(", "));
    }

    let csc = adata.x.matrix.to_csc();
    let per_gene: Vec<(Vec<f64>, Vec<f64>)> = found
        .par_iter()
        .map(|&(_, pos)| {
            let mut sums = vec![0.0; groups.len()];
            let mut expressing = vec![0.0; groups.len()];
            if let Some(col) = pos.and_then(|p| csc.outer_view(p)) {
                for (cell, &v) in col.iter() {
                    sums[group_of[cell]] += v;
                    if v != 0.0 {
                        expressing[group_of[cell]] += 1.0;
                    }
                }
            }
            let per_cell = |v: Vec<f64>| -> Vec<f64> {
                v.into_iter()
                    .zip(&group_size)
                    .map(|(x, &n)| if n == 0 { 0.0 } else { x / n as f64 })
                    .collect()
            };
            (per_cell(expressing), per_cell(sums))
        })
        .collect();

    let shape = (groups.len(), found.len());
    let mut fraction = Array2::zeros(shape);
    let mut mean = Array2::zeros(shape);
    for (j, (frac, avg)) in per_gene.into_iter().enumerate() {
        for i in 0..groups.len() {
            fraction[[i, j]] = frac[i];
            mean[[i, j]] = avg[i];
        }
    }
    Ok(DotPlotStats {
        groups,
        genes: found.into_iter().map(|(g, _)| g.to_string()).collect(),
        fraction,
        mean,
    })
}

/// Writes HTML figures for visual inspection into one directory.
pub struct FigureWriter {
    dir: PathBuf,
}

impl FigureWriter {
    /// Write figures into `dir`, creating it if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<FigureWriter, Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).with_context(|| dir.display().to_string())?;
        Ok(FigureWriter { dir })
    }

    /// Output directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, name: &str, plot: &Plot) -> Result<PathBuf, Error> {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = self.dir.join(format!("{file_name}.html"));
        std::fs::write(&path, plot.to_html()).with_context(|| path.display().to_string())?;
        debug!("wrote {}", path.display());
        Ok(path)
    }

    fn umap(adata: &AnnMatrix) -> Result<(Vec<f64>, Vec<f64>), Error> {
        let emb = adata
            .obsm_array(UMAP_KEY)
            .context("plotting needs an embedding")?;
        if emb.ncols() < 2 {
            bail!("{UMAP_KEY} has {} dimensions", emb.ncols());
        }
        Ok((emb.column(0).to_vec(), emb.column(1).to_vec()))
    }

    /// Embedding colored by the categorical `obs[key]`, one trace per label
    pub fn categorical(&self, name: &str, adata: &AnnMatrix, key: &str) -> Result<PathBuf, Error> {
        let (x, y) = FigureWriter::umap(adata)?;
        let labels = adata.obs_labels(key)?;
        let mut plot = Plot::new();
        for (i, group) in sorted_groups(labels.iter().copied()).iter().enumerate() {
            let rows: Vec<usize> = (0..labels.len()).filter(|&r| labels[r] == group.as_str()).collect();
            let color = hex_num_to_rgb(CATEGORY_COLORS[i % CATEGORY_COLORS.len()]);
            plot.add_trace(
                Scatter::new(rows.iter().map(|&r| x[r]).collect(), rows.iter().map(|&r| y[r]).collect())
                    .mode(Mode::Markers)
                    .name(group.as_str())
                    .marker(Marker::new().color(color).size(POINT_SIZE)),
            );
        }
        plot.set_layout(embedding_layout(key));
        self.write(name, &plot)
    }

    /// Embedding colored by `values`, binned on a sequential scale clipped at `vmax` (or the
    /// largest value)
    pub fn numeric(
        &self,
        name: &str,
        adata: &AnnMatrix,
        title: &str,
        values: &[f64],
        vmax: Option<f64>,
    ) -> Result<PathBuf, Error> {
        let (x, y) = FigureWriter::umap(adata)?;
        if values.len() != x.len() {
            bail!("{} values for {} cells", values.len(), x.len());
        }
        let max = vmax.unwrap_or_else(|| values.iter().copied().fold(0.0, f64::max));
        let n_bins = SEQUENTIAL_COLORS.len();
        let mut plot = Plot::new();
        for b in 0..n_bins {
            let rows: Vec<usize> = (0..values.len())
                .filter(|&r| bin(values[r], max, n_bins) == b)
                .collect();
            if rows.is_empty() {
                continue;
            }
            let upper = max * (b + 1) as f64 / n_bins as f64;
            plot.add_trace(
                Scatter::new(rows.iter().map(|&r| x[r]).collect(), rows.iter().map(|&r| y[r]).collect())
                    .mode(Mode::Markers)
                    .name(format!("≤ {upper:.1}").as_str())
                    .marker(
                        Marker::new()
                            .color(hex_num_to_rgb(SEQUENTIAL_COLORS[b]))
                            .size(POINT_SIZE),
                    ),
            );
        }
        plot.set_layout(embedding_layout(title));
        self.write(name, &plot)
    }

    /// One expression scatter per marker gene, named `{prefix}_{cell type}_{gene}`
    pub fn marker_overview(&self, prefix: &str, adata: &AnnMatrix, markers: &MarkerTable) -> Result<Vec<PathBuf>, Error> {
        let mut written = Vec::new();
        for (cell_type, gene) in markers.iter() {
            let Some(expr) = adata.gene_expression(gene) else {
                debug!("no expression for marker {gene}");
                continue;
            };
            let title = format!("{gene} ({cell_type})");
            written.push(self.numeric(&format!("{prefix}_{cell_type}_{gene}"), adata, &title, &expr, None)?);
        }
        Ok(written)
    }

    /// Dot plot of the marker genes over the groups of `obs[groupby]`
    pub fn dotplot(&self, name: &str, adata: &AnnMatrix, markers: &MarkerTable, groupby: &str) -> Result<PathBuf, Error> {
        let stats = dotplot_stats(adata, &markers.genes(), groupby)?;
        let max_mean = stats.mean.iter().copied().fold(0.0, f64::max);
        let (mut xs, mut ys, mut sizes, mut colors) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for ((i, j), &frac) in stats.fraction.indexed_iter() {
            if frac == 0.0 {
                continue;
            }
            xs.push(stats.genes[j].clone());
            ys.push(stats.groups[i].clone());
            sizes.push(2 + (frac * 18.0).round() as usize);
            let b = bin(stats.mean[[i, j]], max_mean, SEQUENTIAL_COLORS.len());
            colors.push(hex_num_to_rgb(SEQUENTIAL_COLORS[b]));
        }
        let mut plot = Plot::new();
        plot.add_trace(
            Scatter::new(xs, ys)
                .mode(Mode::Markers)
                .marker(Marker::new().size_array(sizes).color_array(colors)),
        );
        plot.set_layout(
            Layout::new()
                .title(Title::with_text(&format!("marker genes by {groupby}")))
                .height(300 + 20 * stats.groups.len())
                .width(300 + 15 * stats.genes.len()),
        );
        self.write(name, &plot)
    }

    /// Bar plot of the log2 fold changes of ranked genes, labelled with their mean log-normalized
    /// expression in the group
    pub fn ranked_genes(&self, name: &str, title: &str, ranked: &[RankedGene]) -> Result<PathBuf, Error> {
        if ranked.is_empty() {
            bail!("no ranked genes to plot for {title}");
        }
        let genes: Vec<String> = ranked.iter().map(|r| r.gene.clone()).collect();
        let fold: Vec<f64> = ranked.iter().map(|r| r.log2_fold_change).collect();
        let expression: Vec<String> = ranked.iter().map(|r| format!("{:.2}", r.mean_log_expression)).collect();
        let mut plot = Plot::new();
        plot.add_trace(Bar::new(genes, fold).name("log2 fold change").text_array(expression));
        plot.set_layout(
            Layout::new()
                .title(Title::with_text(title))
                .height(400)
                .width(1200)
                .y_axis(Axis::new().title(Title::with_text("log2 fold change"))),
        );
        self.write(name, &plot)
    }
}
