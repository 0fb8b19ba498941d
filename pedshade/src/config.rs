//! Pipeline configuration.
//!
//! Every constant both stages need lives here. `Default` reproduces the
//! Amsterdam setup; a TOML file may override any subset of fields.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collect::global_variables::{root_file, OVERPASS_TIMEOUT_SECS, OVERPASS_URL};
use crate::error::{PipelineError, Result};
use crate::geo_core::{BoundingBox, EPSG_RD_NEW, EPSG_WGS84};
use crate::geometric::shade_metrics::{BandLayout, TimeWindow};
use crate::geometric::street_network::WayFilter;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mask: MaskConfig,
    pub zonal: ZonalConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }
}

/// Stage A settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub output_layer: String,
    /// `[north, south, east, west]` in `source_epsg`
    pub bbox_nsew: [f64; 4],
    pub source_epsg: i32,
    pub target_epsg: i32,
    pub function_column: String,
    pub type_column: String,
    /// `Gebruiksfunctie` values kept unconditionally
    pub path_categories: Vec<String>,
    /// `Gebruiksfunctie` value kept only for unpaved surface types
    pub road_category: String,
    pub unpaved_types: Vec<String>,
    /// Outward buffer closing gaps between adjacent polygons (target CRS units)
    pub buffer_distance: f64,
}

impl MaskConfig {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::from_nsew(self.bbox_nsew)
    }
}

impl Default for MaskConfig {
    fn default() -> Self {
        MaskConfig {
            input_path: root_file("Inputs", "materialisation.gpkg"),
            output_path: root_file("Masked", "filtered_materialisation.gpkg"),
            output_layer: "filtered_materialisation".to_string(),
            bbox_nsew: [52.43, 52.28, 5.10, 4.74],
            source_epsg: EPSG_WGS84,
            target_epsg: EPSG_RD_NEW,
            function_column: "Gebruiksfunctie".to_string(),
            type_column: "Type".to_string(),
            path_categories: [
                "Fietspad",
                "Halte eiland",
                "Ruiterpad",
                "Speelondergrond",
                "Verkeerseiland",
                "Voetgangersgebied",
                "Voetpad",
                "Voetpad op trap",
                "Winkelerf",
                "Woonerf",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            road_category: "Rijbaan".to_string(),
            unpaved_types: [
                "Elementenverharding",
                "Halfverharding",
                "Kunststofverharding",
                "Onverhard",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            buffer_distance: 0.2,
        }
    }
}

/// Where the pedestrian network comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NetworkSource {
    /// Live Overpass API query
    Overpass { endpoint: String, timeout_secs: u64 },
    /// Overpass JSON response saved on disk
    File { path: PathBuf },
}

impl Default for NetworkSource {
    fn default() -> Self {
        NetworkSource::Overpass {
            endpoint: OVERPASS_URL.to_string(),
            timeout_secs: OVERPASS_TIMEOUT_SECS,
        }
    }
}

/// Stage B settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonalConfig {
    pub raster_path: PathBuf,
    pub boundary_path: PathBuf,
    pub adjustment_curve_path: PathBuf,
    pub zonal_stats_path: PathBuf,
    pub edges_path: PathBuf,
    pub output_path: PathBuf,
    pub output_layer: String,
    /// CRS shared by the raster, the mask and the edge tables
    pub projected_epsg: i32,
    /// Half-width of the sampling polygon around each edge
    pub buffer_distance: f64,
    pub network: NetworkSource,
    pub way_filter: WayFilter,
    pub band_layout: BandLayout,
    /// Window averaged into `avg_exposure_percent`
    pub midday_window: TimeWindow,
}

impl Default for ZonalConfig {
    fn default() -> Self {
        ZonalConfig {
            raster_path: root_file("Masked", "merged.vrt"),
            boundary_path: root_file("Inputs", "GemeenteAmsterdam.geojson"),
            adjustment_curve_path: root_file("Inputs", "adjustment_curve.csv"),
            zonal_stats_path: root_file("Outputs", "zonal_stats.geojson"),
            edges_path: root_file("Outputs", "edges_zonalstats.gpkg"),
            output_path: root_file("Outputs", "3_Shade+PET.gpkg"),
            output_layer: "shade+pet".to_string(),
            projected_epsg: EPSG_RD_NEW,
            buffer_distance: 10.0,
            network: NetworkSource::default(),
            way_filter: WayFilter::default(),
            band_layout: BandLayout::default(),
            midday_window: TimeWindow::midday(),
        }
    }
}
