//! Zonal statistics over a multi-band raster.
//!
//! Each sampling zone gets, per labelled band, the mean of the valid cells it
//! covers, every cell weighted by the fraction of its area inside the zone.
//! Cells equal to the band's nodata value or non-finite are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gdal::Dataset;
use geo::{BoundingRect, Geometry as GeoGeometry, Rect};
use geos::{Geom, PreparedGeometry};

#[cfg(feature = "indicatif")]
use indicatif::{ProgressBar, ProgressStyle};

use crate::commons::geometry_ops::to_geos;
use crate::commons::vector_io::{epsg_code, float_value, FeatureTable, VectorFeature};
use crate::error::{PipelineError, Result};
use crate::geo_core::BoundingBox;
use crate::geometric::shade_metrics::BandLayout;
use crate::geometric::street_network::{EdgeKey, SamplingZone};

#[cfg(feature = "indicatif")]
fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {percent} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Read access to a north-up, multi-band raster
pub trait RasterSource {
    fn epsg(&self) -> Option<i32>;
    fn band_count(&self) -> usize;
    /// (columns, rows)
    fn size(&self) -> (usize, usize);
    /// GDAL affine transform
    fn geo_transform(&self) -> [f64; 6];
    fn no_data(&self, band: usize) -> Option<f64>;
    /// Row-major cell values of a window of a 1-based band
    fn read_window(
        &self,
        band: usize,
        offset: (usize, usize),
        size: (usize, usize),
    ) -> Result<Vec<f64>>;

    fn extent(&self) -> BoundingBox {
        let gt = self.geo_transform();
        let (cols, rows) = self.size();
        let x1 = gt[0] + cols as f64 * gt[1];
        let y1 = gt[3] + rows as f64 * gt[5];
        BoundingBox::new(gt[0].min(x1), gt[3].min(y1), gt[0].max(x1), gt[3].max(y1))
    }
}

/// Raster opened read-only through GDAL (GeoTIFF, VRT, ...)
pub struct GdalRaster {
    path: PathBuf,
    dataset: Dataset,
    epsg: Option<i32>,
    geo_transform: [f64; 6],
}

impl GdalRaster {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PipelineError::io(path, "raster does not exist"));
        }
        let dataset = Dataset::open(path).map_err(|e| PipelineError::io(path, e))?;

        let epsg = dataset.spatial_ref().ok().and_then(epsg_code);
        let geo_transform = dataset
            .geo_transform()
            .map_err(|e| PipelineError::io(path, format!("no geotransform: {}", e)))?;

        Ok(GdalRaster {
            path: path.to_path_buf(),
            dataset,
            epsg,
            geo_transform,
        })
    }
}

impl RasterSource for GdalRaster {
    fn epsg(&self) -> Option<i32> {
        self.epsg
    }

    fn band_count(&self) -> usize {
        self.dataset.raster_count() as usize
    }

    fn size(&self) -> (usize, usize) {
        self.dataset.raster_size()
    }

    fn geo_transform(&self) -> [f64; 6] {
        self.geo_transform
    }

    fn no_data(&self, band: usize) -> Option<f64> {
        self.dataset
            .rasterband(band)
            .ok()
            .and_then(|b| b.no_data_value())
    }

    fn read_window(
        &self,
        band: usize,
        offset: (usize, usize),
        size: (usize, usize),
    ) -> Result<Vec<f64>> {
        let rasterband = self
            .dataset
            .rasterband(band)
            .map_err(|e| PipelineError::io(&self.path, format!("band {}: {}", band, e)))?;
        let buffer = rasterband
            .read_as::<f64>((offset.0 as isize, offset.1 as isize), size, size, None)
            .map_err(|e| PipelineError::io(&self.path, format!("band {}: {}", band, e)))?;
        Ok(buffer.data().to_vec())
    }
}

/// Raster held in memory, one row-major vector per band
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryRaster {
    pub epsg: Option<i32>,
    pub geo_transform: [f64; 6],
    pub cols: usize,
    pub rows: usize,
    pub bands: Vec<Vec<f64>>,
    pub no_data: Option<f64>,
}

impl RasterSource for MemoryRaster {
    fn epsg(&self) -> Option<i32> {
        self.epsg
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn size(&self) -> (usize, usize) {
        (self.cols, self.rows)
    }

    fn geo_transform(&self) -> [f64; 6] {
        self.geo_transform
    }

    fn no_data(&self, _band: usize) -> Option<f64> {
        self.no_data
    }

    fn read_window(
        &self,
        band: usize,
        offset: (usize, usize),
        size: (usize, usize),
    ) -> Result<Vec<f64>> {
        let data = band
            .checked_sub(1)
            .and_then(|i| self.bands.get(i))
            .ok_or_else(|| PipelineError::RasterMismatch(format!("No band {}", band)))?;
        if offset.0 + size.0 > self.cols || offset.1 + size.1 > self.rows {
            return Err(PipelineError::RasterMismatch(
                "Window exceeds raster bounds".to_string(),
            ));
        }

        let mut window = Vec::with_capacity(size.0 * size.1);
        for row in offset.1..offset.1 + size.1 {
            let start = row * self.cols + offset.0;
            window.extend_from_slice(&data[start..start + size.0]);
        }
        Ok(window)
    }
}

/// Band means of one sampling zone, in layout order
#[derive(Debug, Clone, PartialEq)]
pub struct ZonalRow {
    pub key: EdgeKey,
    pub geometry: GeoGeometry<f64>,
    pub means: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZonalStatistics {
    pub epsg: i32,
    pub layout: BandLayout,
    pub rows: Vec<ZonalRow>,
}

impl ZonalStatistics {
    pub fn by_key(&self) -> HashMap<EdgeKey, &ZonalRow> {
        self.rows.iter().map(|row| (row.key, row)).collect()
    }

    /// Zone polygons with the edge key and one `band_{i}_mean` column per band
    pub fn to_feature_table(&self) -> FeatureTable {
        let mut table = FeatureTable::new(self.epsg);
        for row in &self.rows {
            let mut feature = VectorFeature::new(row.geometry.clone());
            row.key.insert_into(&mut feature.properties);
            for (band, mean) in self.layout.bands.iter().zip(&row.means) {
                feature
                    .properties
                    .insert(format!("band_{}_mean", band.index), float_value(*mean));
            }
            table.push(feature);
        }
        table
    }
}

/// Cells of a window and the share of each covered by a zone
struct CoverageWindow {
    offset: (usize, usize),
    size: (usize, usize),
    /// (index in the window, coverage fraction)
    weights: Vec<(usize, f64)>,
}

fn check_raster(raster: &dyn RasterSource, layout: &BandLayout, vector_epsg: i32) -> Result<()> {
    match raster.epsg() {
        Some(epsg) if epsg == vector_epsg => {}
        Some(epsg) => {
            return Err(PipelineError::RasterMismatch(format!(
                "Raster CRS EPSG:{} differs from vector CRS EPSG:{}",
                epsg, vector_epsg
            )))
        }
        None => {
            return Err(PipelineError::RasterMismatch(
                "Raster has no EPSG-identified CRS".to_string(),
            ))
        }
    }

    if raster.band_count() < layout.max_band() {
        return Err(PipelineError::RasterMismatch(format!(
            "Raster has {} bands, layout needs {}",
            raster.band_count(),
            layout.max_band()
        )));
    }

    let gt = raster.geo_transform();
    if gt[2] != 0.0 || gt[4] != 0.0 {
        return Err(PipelineError::RasterMismatch(
            "Rotated rasters are not supported".to_string(),
        ));
    }
    if gt[1] == 0.0 || gt[5] == 0.0 {
        return Err(PipelineError::RasterMismatch(
            "Raster has a zero pixel size".to_string(),
        ));
    }
    Ok(())
}

fn zones_extent(zones: &[SamplingZone]) -> Option<BoundingBox> {
    zones
        .iter()
        .filter_map(|zone| zone.geometry.bounding_rect())
        .map(|r| BoundingBox::new(r.min().x, r.min().y, r.max().x, r.max().y))
        .reduce(|a, b| {
            BoundingBox::new(
                a.min_x.min(b.min_x),
                a.min_y.min(b.min_y),
                a.max_x.max(b.max_x),
                a.max_y.max(b.max_y),
            )
        })
}

/// Range of cell indices along one axis touched by [lo, hi]
fn cell_range(lo: f64, hi: f64, origin: f64, step: f64, count: usize) -> (usize, usize) {
    let a = (lo - origin) / step;
    let b = (hi - origin) / step;
    let start = a.min(b).floor().max(0.0) as usize;
    let end = (a.max(b).ceil().max(0.0) as usize).min(count);
    (start.min(count), end)
}

fn coverage(raster: &dyn RasterSource, zone: &GeoGeometry<f64>) -> Result<Option<CoverageWindow>> {
    let Some(bounds) = zone.bounding_rect() else {
        return Ok(None);
    };
    let gt = raster.geo_transform();
    let (cols, rows) = raster.size();

    let (col_start, col_end) = cell_range(bounds.min().x, bounds.max().x, gt[0], gt[1], cols);
    let (row_start, row_end) = cell_range(bounds.min().y, bounds.max().y, gt[3], gt[5], rows);
    if col_start >= col_end || row_start >= row_end {
        return Ok(None);
    }

    let zone_geos = to_geos(zone)?;
    let prepared: PreparedGeometry = zone_geos.to_prepared_geom()?;
    let cell_area = (gt[1] * gt[5]).abs();
    let width = col_end - col_start;

    let mut weights = Vec::new();
    for row in row_start..row_end {
        for col in col_start..col_end {
            let x0 = gt[0] + col as f64 * gt[1];
            let y0 = gt[3] + row as f64 * gt[5];
            let cell = Rect::new((x0, y0), (x0 + gt[1], y0 + gt[5])).to_polygon();
            let cell_geos = to_geos(&GeoGeometry::Polygon(cell))?;

            let fraction = if prepared.contains(&cell_geos)? {
                1.0
            } else if prepared.intersects(&cell_geos)? {
                (zone_geos.intersection(&cell_geos)?.area()? / cell_area).min(1.0)
            } else {
                continue;
            };

            if fraction > 0.0 {
                let index = (row - row_start) * width + (col - col_start);
                weights.push((index, fraction));
            }
        }
    }

    Ok(Some(CoverageWindow {
        offset: (col_start, row_start),
        size: (width, row_end - row_start),
        weights,
    }))
}

fn weighted_mean(values: &[f64], weights: &[(usize, f64)], no_data: Option<f64>) -> f64 {
    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for &(index, weight) in weights {
        let value = values[index];
        if !value.is_finite() || no_data.map_or(false, |nd| value == nd) {
            continue;
        }
        total += value * weight;
        weight_sum += weight;
    }

    if weight_sum > 0.0 {
        total / weight_sum
    } else {
        f64::NAN
    }
}

/// Coverage-weighted mean of every labelled band for every zone.
///
/// Zones and raster must share `vector_epsg`; the raster must provide the
/// highest band of `layout` and overlap the zones. A zone covering no valid
/// cell gets `NaN`.
pub fn zonal_means(
    raster: &dyn RasterSource,
    zones: &[SamplingZone],
    layout: &BandLayout,
    vector_epsg: i32,
) -> Result<ZonalStatistics> {
    check_raster(raster, layout, vector_epsg)?;

    if let Some(extent) = zones_extent(zones) {
        if !extent.intersects(&raster.extent()) {
            return Err(PipelineError::RasterMismatch(
                "Raster extent does not overlap the sampling zones".to_string(),
            ));
        }
    }

    let no_data: Vec<Option<f64>> = layout.bands.iter().map(|b| raster.no_data(b.index)).collect();

    #[cfg(feature = "indicatif")]
    let pb = {
        let pb = ProgressBar::new(zones.len() as u64);
        pb.set_style(progress_style());
        pb.set_message("Zonal statistics");
        pb
    };

    let mut rows = Vec::with_capacity(zones.len());
    for zone in zones {
        let means = match coverage(raster, &zone.geometry)? {
            Some(window) => layout
                .bands
                .iter()
                .zip(&no_data)
                .map(|(band, nd)| {
                    let values = raster.read_window(band.index, window.offset, window.size)?;
                    Ok(weighted_mean(&values, &window.weights, *nd))
                })
                .collect::<Result<Vec<_>>>()?,
            None => vec![f64::NAN; layout.len()],
        };

        rows.push(ZonalRow {
            key: zone.key,
            geometry: zone.geometry.clone(),
            means,
        });

        #[cfg(feature = "indicatif")]
        pb.inc(1);
    }

    #[cfg(feature = "indicatif")]
    pb.finish_with_message("Zonal statistics done");

    Ok(ZonalStatistics {
        epsg: vector_epsg,
        layout: layout.clone(),
        rows,
    })
}
