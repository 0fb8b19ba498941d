use geo::{Geometry as GeoGeometry, MultiPolygon, Polygon};
use geos::{Geom, Geometry as GeosGeometry};

use crate::error::{PipelineError, Result};

/// Segments per quarter circle when rounding buffer corners
pub const BUFFER_QUADRANT_SEGMENTS: i32 = 16;

/// Convert geo::Geometry to GEOS
pub fn to_geos(geometry: &GeoGeometry<f64>) -> Result<GeosGeometry> {
    let geos_geom: GeosGeometry = geometry
        .clone()
        .try_into()
        .map_err(|e| PipelineError::Geometry(format!("geo -> GEOS: {}", e)))?;
    Ok(geos_geom)
}

/// Convert GEOS to geo::Geometry
pub fn from_geos(geometry: GeosGeometry) -> Result<GeoGeometry<f64>> {
    let geo_geom: GeoGeometry<f64> = geometry
        .try_into()
        .map_err(|e| PipelineError::Geometry(format!("GEOS -> geo: {}", e)))?;
    Ok(geo_geom)
}

/// Parse WKT (as produced by GDAL) through GEOS
pub fn from_wkt(wkt: &str) -> Result<GeoGeometry<f64>> {
    let geos_geom = GeosGeometry::new_from_wkt(wkt)?;
    from_geos(geos_geom)
}

pub fn to_wkt(geometry: &GeoGeometry<f64>) -> Result<String> {
    Ok(to_geos(geometry)?.to_wkt()?)
}

/// Outward buffer with round joins
pub fn buffer(geometry: &GeoGeometry<f64>, distance: f64) -> Result<GeoGeometry<f64>> {
    let buffered = to_geos(geometry)?.buffer(distance, BUFFER_QUADRANT_SEGMENTS)?;
    from_geos(buffered)
}

/// Polygonal part of `geometry` inside `mask`.
///
/// Parts lying partly outside the mask are truncated at the mask boundary;
/// `None` when nothing polygonal remains.
pub fn clip(geometry: &GeoGeometry<f64>, mask: &Polygon<f64>) -> Result<Option<GeoGeometry<f64>>> {
    let mask_geos = to_geos(&GeoGeometry::Polygon(mask.clone()))?;
    let intersection = to_geos(geometry)?.intersection(&mask_geos)?;
    if intersection.is_empty()? {
        return Ok(None);
    }

    let polygons = explode(&from_geos(intersection)?);
    Ok(match polygons.len() {
        0 => None,
        1 => polygons.into_iter().next().map(GeoGeometry::Polygon),
        _ => Some(GeoGeometry::MultiPolygon(MultiPolygon::new(polygons))),
    })
}

/// Union of all geometries into a single one; `None` for empty input
pub fn dissolve(geometries: &[GeoGeometry<f64>]) -> Result<Option<GeoGeometry<f64>>> {
    if geometries.is_empty() {
        return Ok(None);
    }

    let parts = geometries
        .iter()
        .map(to_geos)
        .collect::<Result<Vec<_>>>()?;
    let collection = GeosGeometry::create_geometry_collection(parts)?;
    let union = collection.unary_union()?;
    if union.is_empty()? {
        return Ok(None);
    }

    Ok(Some(from_geos(union)?))
}

/// Split a (multi-part) geometry into its simple polygons.
/// Lines and points produced by touching boundaries are dropped.
pub fn explode(geometry: &GeoGeometry<f64>) -> Vec<Polygon<f64>> {
    match geometry {
        GeoGeometry::Polygon(p) => vec![p.clone()],
        GeoGeometry::MultiPolygon(mp) => mp.0.clone(),
        GeoGeometry::Rect(r) => vec![r.to_polygon()],
        GeoGeometry::Triangle(t) => vec![t.to_polygon()],
        GeoGeometry::GeometryCollection(gc) => gc.iter().flat_map(explode).collect(),
        _ => Vec::new(),
    }
}
