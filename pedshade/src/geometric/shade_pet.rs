use std::collections::BTreeMap;
use std::path::PathBuf;

use geo::{Geometry as GeoGeometry, MultiPolygon};

#[cfg(feature = "polars")]
use polars::prelude::*;

use crate::collect::overpass::overpass_collect::load_network_data;
use crate::commons::vector_io::{float_value, FeatureTable, VectorFeature};
use crate::config::ZonalConfig;
use crate::error::{PipelineError, Result};
use crate::geo_core::{CrsTransformer, EPSG_WGS84};
use crate::geometric::shade_metrics::{AdjustmentCurve, BandLayout, EdgeMetrics, ShadeMetrics};
use crate::geometric::street_network::{StreetEdge, StreetNetwork};
use crate::geometric::zonal_stats::{zonal_means, GdalRaster, RasterSource, ZonalStatistics};

/// Street edge with its band means and derived metrics
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEdge {
    pub edge: StreetEdge,
    /// Band label -> zonal mean
    pub values: BTreeMap<String, f64>,
    pub metrics: Option<EdgeMetrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEdges {
    pub epsg: i32,
    pub layout: BandLayout,
    pub edges: Vec<EnrichedEdge>,
}

impl EnrichedEdges {
    /// Attach zone means to edges by edge key. Edges without a zone get no values.
    pub fn join(network: &StreetNetwork, stats: &ZonalStatistics) -> Self {
        let by_key = stats.by_key();
        let mut unmatched = 0usize;

        let edges = network
            .edges
            .iter()
            .map(|edge| {
                let values = match by_key.get(&edge.key) {
                    Some(row) => stats
                        .layout
                        .bands
                        .iter()
                        .zip(&row.means)
                        .map(|(band, mean)| (band.label.clone(), *mean))
                        .collect(),
                    None => {
                        unmatched += 1;
                        BTreeMap::new()
                    }
                };
                EnrichedEdge {
                    edge: edge.clone(),
                    values,
                    metrics: None,
                }
            })
            .collect();

        if unmatched > 0 {
            log::warn!("{} edges have no zonal statistics", unmatched);
        }

        EnrichedEdges {
            epsg: network.epsg,
            layout: stats.layout.clone(),
            edges,
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Every band column present as a float; missing values become NaN
    pub fn normalise(&mut self) {
        let labels = self.layout.labels();
        for edge in &mut self.edges {
            for label in &labels {
                edge.values.entry(label.clone()).or_insert(f64::NAN);
            }
        }
    }

    pub fn compute_metrics(&mut self, metrics: &ShadeMetrics) {
        let rows: Vec<BTreeMap<String, f64>> =
            self.edges.iter().map(|e| e.values.clone()).collect();
        for (edge, computed) in self.edges.iter_mut().zip(metrics.compute_all(&rows)) {
            edge.metrics = Some(computed);
        }
    }

    /// Edge attributes, one column per band label, then the metrics once computed
    pub fn to_feature_table(&self) -> FeatureTable {
        let labels = self.layout.labels();
        let mut table = FeatureTable::new(self.epsg);

        for enriched in &self.edges {
            let mut feature = VectorFeature {
                geometry: GeoGeometry::LineString(enriched.edge.geometry.clone()),
                properties: enriched.edge.properties(),
            };
            for label in &labels {
                if let Some(value) = enriched.values.get(label) {
                    feature.properties.insert(label.clone(), float_value(*value));
                }
            }
            if let Some(metrics) = enriched.metrics {
                feature
                    .properties
                    .insert("sum_adjust".to_string(), float_value(metrics.sum_adjust));
                feature.properties.insert(
                    "avg_exposure_percent".to_string(),
                    float_value(metrics.avg_exposure_percent),
                );
                feature.properties.insert(
                    "avg_shade_percent".to_string(),
                    float_value(metrics.avg_shade_percent),
                );
            }
            table.push(feature);
        }
        table
    }

    /// Attribute table as a Polars DataFrame (geometry excluded)
    #[cfg(feature = "polars")]
    pub fn to_polars_df(&self) -> Result<DataFrame> {
        let polars_err = |e: PolarsError| PipelineError::Schema(e.to_string());

        let mut df = df! [
            "u" => self.edges.iter().map(|e| e.edge.key.u).collect::<Vec<_>>(),
            "v" => self.edges.iter().map(|e| e.edge.key.v).collect::<Vec<_>>(),
            "key" => self.edges.iter().map(|e| e.edge.key.key).collect::<Vec<_>>(),
            "osmid" => self.edges.iter().map(|e| e.edge.osmid).collect::<Vec<_>>(),
            "highway" => self.edges.iter().map(|e| e.edge.highway.clone()).collect::<Vec<_>>(),
            "name" => self.edges.iter().map(|e| e.edge.name.clone()).collect::<Vec<_>>(),
            "length" => self.edges.iter().map(|e| e.edge.length).collect::<Vec<_>>(),
        ]
        .map_err(polars_err)?;

        for label in self.layout.labels() {
            let values: Vec<Option<f64>> = self
                .edges
                .iter()
                .map(|e| e.values.get(&label).copied())
                .collect();
            df.with_column(Series::new(label.as_str().into(), values))
                .map_err(polars_err)?;
        }

        let metric_columns: [(&str, fn(&EdgeMetrics) -> f64); 3] = [
            ("sum_adjust", |m| m.sum_adjust),
            ("avg_exposure_percent", |m| m.avg_exposure_percent),
            ("avg_shade_percent", |m| m.avg_shade_percent),
        ];
        for (name, field) in metric_columns {
            let values: Vec<Option<f64>> = self
                .edges
                .iter()
                .map(|e| e.metrics.as_ref().map(field))
                .collect();
            df.with_column(Series::new(name.into(), values))
                .map_err(polars_err)?;
        }

        Ok(df)
    }
}

/// Outcome of a zonal statistics run
#[derive(Debug, Clone, PartialEq)]
pub struct ZonalReport {
    pub band_count: usize,
    pub edges: usize,
    pub zones: usize,
    pub outputs: Vec<PathBuf>,
}

/// Area of interest from the first feature of the boundary table, in WGS84.
/// Multi-part boundaries (islands, exclaves) keep every part.
pub fn area_of_interest(boundary: &FeatureTable) -> Result<MultiPolygon<f64>> {
    let first = boundary
        .features
        .first()
        .ok_or_else(|| PipelineError::Schema("Boundary file has no features".to_string()))?;

    let area = match &first.geometry {
        GeoGeometry::Polygon(p) => MultiPolygon::new(vec![p.clone()]),
        GeoGeometry::MultiPolygon(mp) if !mp.0.is_empty() => mp.clone(),
        other => {
            return Err(PipelineError::Schema(format!(
                "Boundary geometry must be a polygon, got {}",
                geometry_kind(other)
            )))
        }
    };

    if boundary.epsg == EPSG_WGS84 {
        Ok(area)
    } else {
        CrsTransformer::new(boundary.epsg, EPSG_WGS84)?.transform_multi_polygon(&area)
    }
}

fn geometry_kind(geometry: &GeoGeometry<f64>) -> &'static str {
    match geometry {
        GeoGeometry::Point(_) => "Point",
        GeoGeometry::Line(_) => "Line",
        GeoGeometry::LineString(_) => "LineString",
        GeoGeometry::Polygon(_) => "Polygon",
        GeoGeometry::MultiPoint(_) => "MultiPoint",
        GeoGeometry::MultiLineString(_) => "MultiLineString",
        GeoGeometry::MultiPolygon(_) => "MultiPolygon",
        GeoGeometry::GeometryCollection(_) => "GeometryCollection",
        GeoGeometry::Rect(_) => "Rect",
        GeoGeometry::Triangle(_) => "Triangle",
    }
}

/// Project and buffer the edges, then sample the raster under every zone
pub fn sample_network(
    config: &ZonalConfig,
    raster: &dyn RasterSource,
    network: &StreetNetwork,
) -> Result<ZonalStatistics> {
    let projected = network.to_crs(config.projected_epsg)?;
    let zones = projected.sampling_zones(config.buffer_distance)?;
    log::info!("Buffered {} edges by {}", zones.len(), config.buffer_distance);

    zonal_means(raster, &zones, &config.band_layout, config.projected_epsg)
}

/// Stage B entry point
pub fn run_zonal_statistics(config: &ZonalConfig) -> Result<ZonalReport> {
    config.band_layout.validate()?;
    let curve = AdjustmentCurve::from_csv(&config.adjustment_curve_path)?;
    let metrics = ShadeMetrics::new(&config.band_layout, &curve, &config.midday_window)?;

    let raster = GdalRaster::open(&config.raster_path)?;
    log::info!("Virtual raster has {} bands.", raster.band_count());

    let boundary = FeatureTable::read(&config.boundary_path)?;
    let aoi = area_of_interest(&boundary)?;

    let osm = load_network_data(&config.network, &aoi, &config.way_filter)?;
    let network = StreetNetwork::from_overpass(&osm, &aoi, &config.way_filter)?;

    // edges keep their original linestrings; only the zones are projected
    let stats = sample_network(config, &raster, &network)?;
    stats
        .to_feature_table()
        .write(&config.zonal_stats_path, "zonal_stats")?;

    let mut enriched = EnrichedEdges::join(&network, &stats);
    enriched
        .to_feature_table()
        .write(&config.edges_path, &config.output_layer)?;

    enriched.normalise();
    enriched.compute_metrics(&metrics);
    enriched
        .to_feature_table()
        .write(&config.output_path, &config.output_layer)?;

    Ok(ZonalReport {
        band_count: raster.band_count(),
        edges: enriched.len(),
        zones: stats.rows.len(),
        outputs: vec![
            config.zonal_stats_path.clone(),
            config.edges_path.clone(),
            config.output_path.clone(),
        ],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkSource;
    use crate::geometric::shade_metrics::TimeWindow;
    use crate::geometric::street_network::EdgeKey;
    use crate::geometric::zonal_stats::MemoryRaster;
    use geo::{polygon, LineString};

    fn edge(u: i64, v: i64, key: u32, line: Vec<(f64, f64)>) -> StreetEdge {
        StreetEdge {
            key: EdgeKey::new(u, v, key),
            osmid: 100 + u,
            highway: "footway".to_string(),
            name: None,
            oneway: false,
            reversed: false,
            length: 10.0,
            geometry: LineString::from(line),
        }
    }

    fn layout() -> BandLayout {
        BandLayout::from_labels(["1100", "1130", "PET"])
    }

    fn metrics() -> ShadeMetrics {
        let curve = AdjustmentCurve::from_weights([("1100", 1.0), ("1130", 2.0)]);
        ShadeMetrics::new(&layout(), &curve, &TimeWindow::new("1100", "1130", 30)).unwrap()
    }

    /// 100 x 100 m raster in RD New: shade 0.25 / 0.75, PET 30
    fn raster() -> MemoryRaster {
        MemoryRaster {
            epsg: Some(28992),
            geo_transform: [0.0, 1.0, 0.0, 100.0, 0.0, -1.0],
            cols: 100,
            rows: 100,
            bands: vec![vec![0.25; 10_000], vec![0.75; 10_000], vec![30.0; 10_000]],
            no_data: None,
        }
    }

    fn enrich(network: &StreetNetwork) -> (ZonalStatistics, EnrichedEdges) {
        let stats = sample_network(&config(), &raster(), network).unwrap();
        let mut enriched = EnrichedEdges::join(network, &stats);
        enriched.normalise();
        enriched.compute_metrics(&metrics());
        (stats, enriched)
    }

    fn config() -> ZonalConfig {
        ZonalConfig {
            projected_epsg: 28992,
            buffer_distance: 2.0,
            band_layout: layout(),
            ..ZonalConfig::default()
        }
    }

    #[test]
    fn test_join_is_by_key_not_position() {
        let network = StreetNetwork {
            epsg: 28992,
            edges: vec![
                edge(1, 2, 0, vec![(10.0, 10.0), (20.0, 10.0)]),
                edge(2, 1, 0, vec![(20.0, 10.0), (10.0, 10.0)]),
            ],
        };
        let mut zones = network.sampling_zones(2.0).unwrap();
        zones.reverse();

        let stats = zonal_means(&raster(), &zones, &layout(), 28992).unwrap();
        let mut stats_shuffled = stats.clone();
        stats_shuffled.rows[0].means = vec![1.0, 1.0, 1.0];

        let joined = EnrichedEdges::join(&network, &stats_shuffled);
        // rows[0] is the zone of edge (2, 1, 0)
        assert_eq!(joined.edges[1].values["PET"], 1.0);
        assert!((joined.edges[0].values["PET"] - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalise_fills_nan() {
        let network = StreetNetwork {
            epsg: 28992,
            edges: vec![edge(1, 2, 0, vec![(10.0, 10.0), (20.0, 10.0)])],
        };
        let stats = ZonalStatistics {
            epsg: 28992,
            layout: layout(),
            rows: Vec::new(),
        };

        let mut joined = EnrichedEdges::join(&network, &stats);
        assert!(joined.edges[0].values.is_empty());
        joined.normalise();
        assert_eq!(joined.edges[0].values.len(), 3);
        assert!(joined.edges[0].values["1130"].is_nan());
    }

    #[test]
    fn test_sample_and_enrich() {
        let network = StreetNetwork {
            epsg: 28992,
            edges: vec![
                edge(1, 2, 0, vec![(10.0, 10.0), (20.0, 10.0)]),
                edge(2, 3, 0, vec![(20.0, 10.0), (20.0, 40.0)]),
            ],
        };

        let (stats, enriched) = enrich(&network);
        assert_eq!(stats.rows.len(), 2);
        assert_eq!(enriched.len(), 2);

        for edge in &enriched.edges {
            let m = edge.metrics.unwrap();
            // 0.25 * 1 + 0.75 * 2
            assert!((m.sum_adjust - 1.75).abs() < 1e-9);
            assert!((m.avg_exposure_percent - 0.5).abs() < 1e-9);
            assert!((m.avg_shade_percent - 0.5).abs() < 1e-9);
            assert!((edge.values["PET"] - 30.0).abs() < 1e-9);
        }

        // edges keep their linestrings
        assert_eq!(enriched.edges[1].edge.geometry, network.edges[1].geometry);
    }

    #[test]
    fn test_feature_table_columns() {
        let network = StreetNetwork {
            epsg: 28992,
            edges: vec![edge(1, 2, 0, vec![(10.0, 10.0), (20.0, 10.0)])],
        };
        let (_, enriched) = enrich(&network);

        let table = enriched.to_feature_table();
        let expected = [
            "u", "v", "key", "osmid", "highway", "name", "oneway", "reversed", "length",
            "1100", "1130", "PET", "sum_adjust", "avg_exposure_percent", "avg_shade_percent",
        ];
        assert_eq!(table.columns, expected);
    }

    #[cfg(feature = "polars")]
    #[test]
    fn test_to_polars_df() {
        let network = StreetNetwork {
            epsg: 28992,
            edges: vec![
                edge(1, 2, 0, vec![(10.0, 10.0), (20.0, 10.0)]),
                edge(2, 1, 0, vec![(20.0, 10.0), (10.0, 10.0)]),
            ],
        };
        let (_, enriched) = enrich(&network);

        let df = enriched.to_polars_df().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 7 + 3 + 3);
    }

    #[test]
    fn test_area_of_interest() {
        let mut boundary = FeatureTable::new(4326);
        assert!(matches!(area_of_interest(&boundary), Err(PipelineError::Schema(_))));

        boundary.push(VectorFeature::new(GeoGeometry::LineString(LineString::from(vec![
            (4.9, 52.3),
            (5.0, 52.4),
        ]))));
        assert!(matches!(area_of_interest(&boundary), Err(PipelineError::Schema(_))));

        let square = polygon![
            (x: 4.9, y: 52.3),
            (x: 5.0, y: 52.3),
            (x: 5.0, y: 52.4),
            (x: 4.9, y: 52.3),
        ];
        let mut boundary = FeatureTable::new(4326);
        boundary.push(VectorFeature::new(GeoGeometry::Polygon(square.clone())));
        assert_eq!(
            area_of_interest(&boundary).unwrap(),
            MultiPolygon::new(vec![square])
        );
    }

    #[test]
    fn test_area_of_interest_keeps_every_part() {
        let mainland = polygon![
            (x: 121_000.0, y: 487_000.0),
            (x: 122_000.0, y: 487_000.0),
            (x: 122_000.0, y: 488_000.0),
            (x: 121_000.0, y: 487_000.0),
        ];
        let island = polygon![
            (x: 125_000.0, y: 490_000.0),
            (x: 125_500.0, y: 490_000.0),
            (x: 125_500.0, y: 490_500.0),
            (x: 125_000.0, y: 490_000.0),
        ];
        let mut boundary = FeatureTable::new(28992);
        boundary.push(VectorFeature::new(GeoGeometry::MultiPolygon(MultiPolygon::new(
            vec![mainland, island],
        ))));

        let area = area_of_interest(&boundary).unwrap();
        assert_eq!(area.0.len(), 2);
        // reprojected to lon/lat around Amsterdam
        for part in area.iter() {
            for c in part.exterior().coords() {
                assert!((4.8..5.1).contains(&c.x), "x = {}", c.x);
                assert!((52.3..52.5).contains(&c.y), "y = {}", c.y);
            }
        }
    }

    /// 3-band GeoTIFF in RD New around central Amsterdam, 10 m cells
    fn write_geotiff(path: &std::path::Path) {
        use gdal::raster::Buffer;
        use gdal::spatial_ref::SpatialRef;

        let (width, height) = (400usize, 400usize);
        let driver = gdal::DriverManager::get_driver_by_name("GTiff").unwrap();
        let mut dataset = driver
            .create_with_band_type::<f64, _>(path, width, height, 3)
            .unwrap();
        dataset
            .set_geo_transform(&[120_000.0, 10.0, 0.0, 489_000.0, 0.0, -10.0])
            .unwrap();
        dataset
            .set_spatial_ref(&SpatialRef::from_epsg(28992).unwrap())
            .unwrap();

        for (index, value) in [0.25, 0.75, 30.0].into_iter().enumerate() {
            let mut band = dataset.rasterband(index + 1).unwrap();
            let mut buffer = Buffer::new((width, height), vec![value; width * height]);
            band.write((0, 0), (width, height), &mut buffer).unwrap();
        }
    }

    #[test]
    fn test_run_zonal_statistics_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let raster_path = dir.path().join("merged.tif");
        write_geotiff(&raster_path);

        let boundary_path = dir.path().join("boundary.geojson");
        let mut boundary = FeatureTable::new(4326);
        boundary.push(VectorFeature::new(GeoGeometry::Polygon(polygon![
            (x: 4.89, y: 52.365),
            (x: 4.91, y: 52.365),
            (x: 4.91, y: 52.375),
            (x: 4.89, y: 52.375),
            (x: 4.89, y: 52.365),
        ])));
        boundary.write(&boundary_path, "boundary").unwrap();

        let network_path = dir.path().join("network.json");
        std::fs::write(
            &network_path,
            r#"{"elements": [
                {"type": "node", "id": 1, "lat": 52.370, "lon": 4.900},
                {"type": "node", "id": 2, "lat": 52.370, "lon": 4.901},
                {"type": "node", "id": 3, "lat": 52.371, "lon": 4.901},
                {"type": "way", "id": 10, "nodes": [1, 2, 3], "tags": {"highway": "footway"}},
                {"type": "way", "id": 11, "nodes": [2, 3], "tags": {"highway": "motorway"}}
            ]}"#,
        )
        .unwrap();

        let curve_path = dir.path().join("adjustment_curve.csv");
        std::fs::write(&curve_path, "1100,1130\n1.0,2.0\n").unwrap();

        let outputs = dir.path().join("Outputs");
        let config = ZonalConfig {
            raster_path,
            boundary_path,
            adjustment_curve_path: curve_path,
            zonal_stats_path: outputs.join("zonal_stats.geojson"),
            edges_path: outputs.join("edges_zonalstats.gpkg"),
            output_path: outputs.join("3_Shade+PET.gpkg"),
            network: NetworkSource::File { path: network_path },
            band_layout: layout(),
            midday_window: TimeWindow::new("1100", "1130", 30),
            ..ZonalConfig::default()
        };

        let report = run_zonal_statistics(&config).unwrap();
        assert_eq!(report.band_count, 3);
        // two segments, both directions
        assert_eq!(report.edges, 4);
        assert_eq!(report.zones, 4);
        assert!(report.outputs.iter().all(|p| p.exists()));

        let zonal = FeatureTable::read(&config.zonal_stats_path).unwrap();
        assert_eq!(zonal.epsg, 28992);
        assert_eq!(zonal.len(), 4);
        for feature in &zonal.features {
            let mean = feature.properties["band_1_mean"].as_f64().unwrap();
            assert!((mean - 0.25).abs() < 1e-9, "mean = {}", mean);
        }

        // band values only, before normalisation and metrics
        let intermediate = FeatureTable::read(&config.edges_path).unwrap();
        assert_eq!(intermediate.len(), 4);
        assert!(intermediate.columns.iter().any(|c| c == "PET"));
        assert!(!intermediate.columns.iter().any(|c| c == "sum_adjust"));

        let output = FeatureTable::read(&config.output_path).unwrap();
        assert_eq!(output.epsg, 4326);
        assert_eq!(output.len(), 4);
        for column in ["u", "v", "key", "1100", "1130", "PET", "sum_adjust", "avg_shade_percent"] {
            assert!(output.columns.iter().any(|c| c == column), "missing {}", column);
        }
        for feature in &output.features {
            let p = &feature.properties;
            assert!((p["sum_adjust"].as_f64().unwrap() - 1.75).abs() < 1e-9);
            assert!((p["avg_exposure_percent"].as_f64().unwrap() - 0.5).abs() < 1e-9);
            assert!((p["avg_shade_percent"].as_f64().unwrap() - 0.5).abs() < 1e-9);
            assert!((p["PET"].as_f64().unwrap() - 30.0).abs() < 1e-9);
            assert!(matches!(feature.geometry, GeoGeometry::LineString(_)));
        }
    }

    #[test]
    fn test_run_fails_fast_on_missing_curve() {
        let config = ZonalConfig {
            adjustment_curve_path: PathBuf::from("/nonexistent/adjustment_curve.csv"),
            ..ZonalConfig::default()
        };
        assert!(matches!(
            run_zonal_statistics(&config),
            Err(PipelineError::Io { .. })
        ));
    }
}
