use std::path::{Path, PathBuf};

use geo::Geometry as GeoGeometry;

use crate::commons::geometry_ops::{buffer, clip, dissolve, explode};
use crate::commons::vector_io::{FeatureTable, VectorFeature};
use crate::config::MaskConfig;
use crate::error::{PipelineError, Result};
use crate::geo_core::{CrsTransformer, GeoCore};

/// Walkable-surface predicate over the `Gebruiksfunctie`/`Type` attributes
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialisationFilter {
    pub path_categories: Vec<String>,
    pub road_category: String,
    pub unpaved_types: Vec<String>,
}

impl MaterialisationFilter {
    pub fn from_config(config: &MaskConfig) -> Self {
        MaterialisationFilter {
            path_categories: config.path_categories.clone(),
            road_category: config.road_category.clone(),
            unpaved_types: config.unpaved_types.clone(),
        }
    }

    /// Path category, or road with an unpaved surface type
    pub fn matches(&self, function: Option<&str>, surface: Option<&str>) -> bool {
        let Some(function) = function else {
            return false;
        };
        if self.path_categories.iter().any(|c| c == function) {
            return true;
        }
        function == self.road_category
            && surface.map_or(false, |t| self.unpaved_types.iter().any(|u| u == t))
    }
}

/// Row counts of a mask run
#[derive(Debug, Clone, PartialEq)]
pub struct MaskReport {
    pub input_rows: usize,
    pub excluded_rows: usize,
    pub output_rows: usize,
    pub output_path: PathBuf,
}

impl MaskReport {
    pub fn filtered_message(&self) -> String {
        format!(
            "Filtered {} rows from the materialisation data.",
            self.excluded_rows
        )
    }

    pub fn output_message(&self) -> String {
        format!("Filtered geodataframe has {} rows.", self.output_rows)
    }
}

/// Instructions for the manual raster steps between the two stages
pub fn advisory(output_path: &Path) -> String {
    format!(
        "\n\
         Filtered materialisation data saved to file: {}\n\
         The raster datasets must be masked with the filtered materialisation data.\n\
         We advise to do this in QGIS or another GIS software for efficiency.\n\
         Also note that for the zonal statistics, the filtered raster datasets must be combined into one virtual raster .vrt file.\n\
         The last band in the virtual raster should be the PET raster.\n",
        output_path.display()
    )
}

/// Materialisation mask builder
pub struct Materialisation {
    pub geo_core: GeoCore,
    config: MaskConfig,
}

impl Materialisation {
    pub fn new(config: MaskConfig) -> Self {
        Materialisation {
            geo_core: GeoCore::new(config.target_epsg),
            config,
        }
    }

    /// Keep walkable rows; returns the filtered table and the excluded count
    pub fn filter(&self, table: &FeatureTable) -> Result<(FeatureTable, usize)> {
        let function_column = self.config.function_column.as_str();
        let type_column = self.config.type_column.as_str();
        table.require_columns(&[function_column, type_column])?;

        let filter = MaterialisationFilter::from_config(&self.config);
        let mut kept = FeatureTable::new(table.epsg);
        kept.columns = table.columns.clone();
        kept.features = table
            .features
            .iter()
            .filter(|f| filter.matches(f.property_str(function_column), f.property_str(type_column)))
            .cloned()
            .collect();

        let excluded = table.len() - kept.len();
        Ok((kept, excluded))
    }

    /// Buffer, clip to the bbox, dissolve and explode
    pub fn build_polygons(&self, table: &FeatureTable) -> Result<FeatureTable> {
        let bbox = self.config.bbox();
        let transformer = CrsTransformer::new(self.config.source_epsg, self.config.target_epsg)?;
        let clip_area = bbox.transform_polygon(&transformer)?;

        let mut clipped: Vec<GeoGeometry<f64>> = Vec::with_capacity(table.len());
        for feature in &table.features {
            let buffered = buffer(&feature.geometry, self.config.buffer_distance)?;
            if let Some(part) = clip(&buffered, &clip_area)? {
                clipped.push(part);
            }
        }
        log::debug!("{} of {} buffered polygons intersect the bbox", clipped.len(), table.len());

        let mut output = FeatureTable::new(self.geo_core.get_epsg());
        let Some(merged) = dissolve(&clipped)? else {
            output.columns = table.columns.clone();
            return Ok(output);
        };

        // dissolve keeps the attributes of the first row
        let attributes = table
            .features
            .first()
            .map(|f| f.properties.clone())
            .unwrap_or_default();
        for polygon in explode(&merged) {
            output.push(VectorFeature {
                geometry: GeoGeometry::Polygon(polygon),
                properties: attributes.clone(),
            });
        }
        Ok(output)
    }

    pub fn run(&self) -> Result<MaskReport> {
        let table = FeatureTable::read(&self.config.input_path)?;
        if table.epsg != self.geo_core.get_epsg() {
            return Err(PipelineError::Projection(format!(
                "Materialisation data is in EPSG:{}, expected EPSG:{}",
                table.epsg,
                self.geo_core.get_epsg()
            )));
        }

        let (filtered, excluded_rows) = self.filter(&table)?;
        let mut report = MaskReport {
            input_rows: table.len(),
            excluded_rows,
            output_rows: 0,
            output_path: self.config.output_path.clone(),
        };
        log::info!("{}", report.filtered_message());

        let output = self.build_polygons(&filtered)?;
        report.output_rows = output.len();
        log::info!("{}", report.output_message());

        output.write(&self.config.output_path, &self.config.output_layer)?;
        println!("{}", advisory(&self.config.output_path));

        Ok(report)
    }
}

/// Stage A entry point
pub fn build_mask(config: &MaskConfig) -> Result<MaskReport> {
    Materialisation::new(config.clone()).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, Area, Polygon};

    fn square(x0: f64, y0: f64, size: f64) -> Polygon<f64> {
        polygon![
            (x: x0, y: y0),
            (x: x0 + size, y: y0),
            (x: x0 + size, y: y0 + size),
            (x: x0, y: y0 + size),
            (x: x0, y: y0),
        ]
    }

    fn surface(polygon: Polygon<f64>, function: &str, kind: &str) -> VectorFeature {
        VectorFeature::new(GeoGeometry::Polygon(polygon))
            .with_property("Gebruiksfunctie", function)
            .with_property("Type", kind)
    }

    #[test]
    fn test_filter_truth_table() {
        let filter = MaterialisationFilter::from_config(&MaskConfig::default());

        assert!(filter.matches(Some("Voetpad"), Some("Gesloten verharding")));
        assert!(filter.matches(Some("Woonerf"), None));
        assert!(filter.matches(Some("Rijbaan"), Some("Onverhard")));
        assert!(filter.matches(Some("Rijbaan"), Some("Elementenverharding")));
        assert!(!filter.matches(Some("Rijbaan"), Some("Gesloten verharding")));
        assert!(!filter.matches(Some("Rijbaan"), None));
        assert!(!filter.matches(Some("Berm"), Some("Onverhard")));
        assert!(!filter.matches(None, Some("Onverhard")));
        // exact, case-sensitive match
        assert!(!filter.matches(Some("voetpad"), None));
    }

    #[test]
    fn test_missing_column_is_schema_error() {
        let mut table = FeatureTable::new(28992);
        table.push(
            VectorFeature::new(GeoGeometry::Polygon(square(0.0, 0.0, 1.0)))
                .with_property("Gebruiksfunctie", "Voetpad"),
        );

        let builder = Materialisation::new(MaskConfig::default());
        assert!(matches!(builder.filter(&table), Err(PipelineError::Schema(_))));
    }

    #[test]
    fn test_build_mask_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("materialisation.geojson");
        let output_path = dir.path().join("Masked").join("filtered.geojson");

        // Central Amsterdam in RD New; first two are 0.3 m apart
        let mut input = FeatureTable::new(28992);
        input.push(surface(square(121_000.0, 487_000.0, 10.0), "Voetpad", "Gesloten verharding"));
        input.push(surface(square(121_010.3, 487_000.0, 10.0), "Rijbaan", "Onverhard"));
        input.push(surface(square(121_100.0, 487_100.0, 10.0), "Rijbaan", "Gesloten verharding"));
        input.write(&input_path, "materialisation").unwrap();

        let config = MaskConfig {
            input_path,
            output_path: output_path.clone(),
            ..MaskConfig::default()
        };
        let report = build_mask(&config).unwrap();

        assert_eq!(report.input_rows, 3);
        assert_eq!(report.excluded_rows, 1);
        assert_eq!(report.filtered_message(), "Filtered 1 rows from the materialisation data.");
        // buffers close the 0.3 m gap
        assert_eq!(report.output_rows, 1);

        let output = FeatureTable::read(&output_path).unwrap();
        assert_eq!(output.epsg, 28992);
        assert_eq!(output.len(), 1);
        let area = output.features[0].geometry.unsigned_area();
        // two buffered squares minus their 0.1 m overlap
        assert!(area > 213.0 && area < 217.0, "area = {}", area);
        // dissolve keeps the first filtered row's attributes
        assert_eq!(output.features[0].property_str("Gebruiksfunctie"), Some("Voetpad"));
        assert_eq!(output.features[0].property_str("Type"), Some("Gesloten verharding"));
    }

    #[test]
    fn test_clip_truncates_partially_outside_polygons() {
        let config = MaskConfig {
            bbox_nsew: [10.0, 0.0, 10.0, 0.0],
            source_epsg: 28992,
            target_epsg: 28992,
            ..MaskConfig::default()
        };
        let builder = Materialisation::new(config);

        let mut table = FeatureTable::new(28992);
        table.push(surface(square(8.0, 2.0, 4.0), "Voetpad", ""));
        table.push(surface(square(50.0, 50.0, 4.0), "Voetpad", ""));

        let output = builder.build_polygons(&table).unwrap();
        assert_eq!(output.len(), 1);
        let area = output.features[0].geometry.unsigned_area();
        // (10 - 7.8) x 4.4 minus the rounded corners outside
        assert!(area > 9.6 && area < 9.7, "area = {}", area);
    }

    #[test]
    fn test_wrong_input_crs_is_projection_error() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("materialisation.geojson");

        let mut input = FeatureTable::new(4326);
        input.push(surface(square(4.9, 52.3, 0.001), "Voetpad", ""));
        input.write(&input_path, "materialisation").unwrap();

        let config = MaskConfig {
            input_path,
            output_path: dir.path().join("out.geojson"),
            ..MaskConfig::default()
        };
        assert!(matches!(build_mask(&config), Err(PipelineError::Projection(_))));
    }

    #[test]
    fn test_advisory_mentions_pet_band() {
        let text = advisory(Path::new("./root/Masked/filtered_materialisation.gpkg"));
        assert!(text.contains("./root/Masked/filtered_materialisation.gpkg"));
        assert!(text.contains("virtual raster .vrt"));
        assert!(text.contains("last band in the virtual raster should be the PET raster"));
    }
}
