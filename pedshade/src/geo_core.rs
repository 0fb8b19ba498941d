use geo::{coord, Geometry, LineString, MapCoords, MultiPolygon, Polygon, Rect};
use proj::Proj;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// WGS84 geographic coordinates (degrees)
pub const EPSG_WGS84: i32 = 4326;
/// Dutch national grid, Amersfoort / RD New (meters)
pub const EPSG_RD_NEW: i32 = 28992;

/// Base struct for CRS handling
/// Carries the projected CRS every table of a stage is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeoCore {
    pub epsg: i32,
}

impl GeoCore {
    pub fn new(epsg: i32) -> Self {
        GeoCore { epsg }
    }

    pub fn get_epsg(&self) -> i32 {
        self.epsg
    }

    /// Transform coordinates from one CRS to another
    pub fn transform_coords(from_epsg: i32, to_epsg: i32, x: f64, y: f64) -> Result<(f64, f64)> {
        CrsTransformer::new(from_epsg, to_epsg)?.convert(x, y)
    }
}

impl Default for GeoCore {
    fn default() -> Self {
        GeoCore::new(EPSG_RD_NEW)
    }
}

/// PROJ transformation between two EPSG codes.
///
/// `Proj::new_known_crs` normalises the pipeline for visualisation, so input
/// and output are always (x, y) = (longitude, latitude) for geographic CRSs,
/// whatever axis order the EPSG registry declares.
pub struct CrsTransformer {
    from_epsg: i32,
    to_epsg: i32,
    proj: Proj,
}

impl CrsTransformer {
    pub fn new(from_epsg: i32, to_epsg: i32) -> Result<Self> {
        let from_crs = format!("EPSG:{}", from_epsg);
        let to_crs = format!("EPSG:{}", to_epsg);

        let proj = Proj::new_known_crs(&from_crs, &to_crs, None).map_err(|e| {
            PipelineError::Projection(format!(
                "Failed to create transformation {} -> {}: {}",
                from_crs, to_crs, e
            ))
        })?;

        Ok(CrsTransformer {
            from_epsg,
            to_epsg,
            proj,
        })
    }

    pub fn convert(&self, x: f64, y: f64) -> Result<(f64, f64)> {
        self.proj.convert((x, y)).map_err(|e| {
            PipelineError::Projection(format!(
                "Failed to transform ({}, {}) from EPSG:{} to EPSG:{}: {}",
                x, y, self.from_epsg, self.to_epsg, e
            ))
        })
    }

    /// Transform every vertex of a geometry
    pub fn transform_geometry(&self, geometry: &Geometry<f64>) -> Result<Geometry<f64>> {
        geometry.try_map_coords(|c| {
            let (x, y) = self.convert(c.x, c.y)?;
            Ok(coord! { x: x, y: y })
        })
    }

    pub fn transform_line_string(&self, line: &LineString<f64>) -> Result<LineString<f64>> {
        line.try_map_coords(|c| {
            let (x, y) = self.convert(c.x, c.y)?;
            Ok(coord! { x: x, y: y })
        })
    }

    pub fn transform_polygon(&self, polygon: &Polygon<f64>) -> Result<Polygon<f64>> {
        polygon.try_map_coords(|c| {
            let (x, y) = self.convert(c.x, c.y)?;
            Ok(coord! { x: x, y: y })
        })
    }

    pub fn transform_multi_polygon(&self, polygons: &MultiPolygon<f64>) -> Result<MultiPolygon<f64>> {
        polygons.try_map_coords(|c| {
            let (x, y) = self.convert(c.x, c.y)?;
            Ok(coord! { x: x, y: y })
        })
    }
}

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64, // west / min longitude
    pub min_y: f64, // south / min latitude
    pub max_x: f64, // east / max longitude
    pub max_y: f64, // north / max latitude
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Build from a `[north, south, east, west]` array
    pub fn from_nsew(nsew: [f64; 4]) -> Self {
        let [north, south, east, west] = nsew;
        BoundingBox::new(west, south, east, north)
    }

    /// Polygon ring in (west, south, east, north) order
    pub fn to_polygon(&self) -> Polygon<f64> {
        Rect::new(
            coord! { x: self.min_x, y: self.min_y },
            coord! { x: self.max_x, y: self.max_y },
        )
        .to_polygon()
    }

    /// Reproject the four corners. The result is generally not axis-aligned
    /// in the target CRS, so it stays a polygon.
    pub fn transform_polygon(&self, transformer: &CrsTransformer) -> Result<Polygon<f64>> {
        transformer.transform_polygon(&self.to_polygon())
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}
