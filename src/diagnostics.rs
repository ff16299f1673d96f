//! Diagnostic raster rendering.
//!
//! Each diagnostic flattens one aspect of a fitting run into a single 2-D
//! raster: mosaics of per-sample vignettes, the coefficient planes, a grid
//! of reconstructed PSFs over the context domain, or the aggregate residual
//! map. Callers decide what to do with the rasters (write them out, plot
//! them); nothing here touches storage.

use ndarray::{Array2, ArrayView2};

use crate::model::PsfModel;
use crate::sample::SampleSet;

/// Tiles per snapshot-grid axis.
const SNAP_WIDTH: usize = 7;

/// Mosaic columns are rounded up to this granularity for the per-sample
/// diagnostics.
const TILE_ROUND: usize = 10;

/// Which diagnostic raster to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Aggregate residual map on the model grid.
    ChiMap,
    /// Every coefficient plane, scaled by its basis value at the domain
    /// corner.
    Components,
    /// Model-subtracted residual vignette of every sample.
    Residuals,
    /// Raw vignette of every sample.
    RawData,
    /// Resampled, normalized retina of every sample.
    Samples,
    /// Retina weight map of every sample.
    Weights,
    /// Reconstructed PSFs on a grid of context positions.
    Snapshots,
}

/// Lay out same-shaped tiles in a `nw`-column mosaic, row-major.
fn mosaic<'a>(tiles: impl Iterator<Item = ArrayView2<'a, f64>>, nw: usize, ntiles: usize) -> Array2<f64> {
    let mut tiles = tiles.peekable();
    let (th, tw) = match tiles.peek() {
        Some(t) => t.dim(),
        None => return Array2::zeros((0, 0)),
    };
    let nh = (ntiles - 1) / nw + 1;

    let mut out = Array2::zeros((nh * th, nw * tw));
    for (n, tile) in tiles.enumerate() {
        let (oy, ox) = ((n / nw) * th, (n % nw) * tw);
        out.slice_mut(ndarray::s![oy..oy + th, ox..ox + tw])
            .assign(&tile);
    }
    out
}

/// Column count for per-sample mosaics: near-square in pixels, rounded up
/// to a multiple of [`TILE_ROUND`].
fn sample_columns(nsample: usize, tile_shape: (usize, usize)) -> usize {
    let (th, tw) = tile_shape;
    let npix = (nsample * th * tw) as f64;
    let nw = (npix.sqrt() / tw as f64 + 1.0) as usize;
    ((nw.max(1) - 1) / TILE_ROUND + 1) * TILE_ROUND
}

/// Render one diagnostic raster for the current model and population.
pub fn render(kind: DiagnosticKind, model: &mut PsfModel, set: &SampleSet) -> Array2<f64> {
    let nsample = set.len();
    match kind {
        DiagnosticKind::ChiMap => model.resi.clone(),

        DiagnosticKind::Components => {
            // Scale each plane by its basis value at the domain corner so
            // the mosaic shows actual contributions.
            let corner = vec![0.5; model.poly.ndim()];
            let basis = model.poly.basis(&corner);
            let npc = model.ncoeff();
            let nw = npc.min(10);
            let scaled: Vec<Array2<f64>> = (0..npc)
                .map(|c| model.comp.index_axis(ndarray::Axis(0), c).mapv(|v| v * basis[c]))
                .collect();
            mosaic(scaled.iter().map(|p| p.view()), nw, npc)
        }

        DiagnosticKind::Residuals => {
            let nw = sample_columns(nsample, set.vig_shape());
            mosaic(set.samples().iter().map(|s| s.vigresi.view()), nw, nsample)
        }

        DiagnosticKind::RawData => {
            let nw = sample_columns(nsample, set.vig_shape());
            mosaic(set.samples().iter().map(|s| s.vig.view()), nw, nsample)
        }

        DiagnosticKind::Samples => {
            let nw = sample_columns(nsample, set.retina_shape());
            mosaic(set.samples().iter().map(|s| s.retina.view()), nw, nsample)
        }

        DiagnosticKind::Weights => {
            let nw = sample_columns(nsample, set.retina_shape());
            mosaic(
                set.samples().iter().map(|s| s.retiweight.view()),
                nw,
                nsample,
            )
        }

        DiagnosticKind::Snapshots => {
            let ndim = model.poly.ndim();
            let nt = SNAP_WIDTH.pow(ndim.max(2) as u32);
            let dstep = 1.0 / SNAP_WIDTH as f64;
            let dstart = (1.0 - dstep) / 2.0;

            let mut pos = vec![-dstart; ndim];
            let mut tiles: Vec<Array2<f64>> = Vec::with_capacity(nt);
            for _ in 0..nt {
                model.build(&pos);
                tiles.push(model.loc.clone());
                // Odometer over the context grid.
                for p in pos.iter_mut() {
                    if *p < dstart - 0.01 {
                        *p += dstep;
                        break;
                    }
                    *p = -dstart;
                }
            }
            mosaic(tiles.iter().map(|t| t.view()), SNAP_WIDTH, nt)
        }
    }
}
