use anyhow::Result;
use pedshade::geometric::shade_metrics::{AdjustmentCurve, BandLayout, ShadeMetrics, TimeWindow};
use pedshade::geometric::shade_pet::{sample_network, EnrichedEdges};
use pedshade::geometric::street_network::{EdgeKey, StreetEdge, StreetNetwork};
use pedshade::geometric::zonal_stats::MemoryRaster;
use pedshade::ZonalConfig;

/// Example: shade metrics of two edges over a synthetic raster, as a Polars DataFrame
fn main() -> Result<()> {
    println!("=== Example: Shade metrics to Polars ===\n");

    let layout = BandLayout::default();
    // exposure rises through the day, PET band last
    let mut bands: Vec<Vec<f64>> = (0..layout.len() - 1)
        .map(|i| vec![i as f64 / 22.0; 400])
        .collect();
    bands.push(vec![35.0; 400]);

    let raster = MemoryRaster {
        epsg: Some(28992),
        geo_transform: [121_000.0, 1.0, 0.0, 487_020.0, 0.0, -1.0],
        cols: 20,
        rows: 20,
        bands,
        no_data: None,
    };

    let edge = |u: i64, v: i64, line: Vec<(f64, f64)>| StreetEdge {
        key: EdgeKey::new(u, v, 0),
        osmid: 1,
        highway: "footway".to_string(),
        name: Some("Voorbeeldpad".to_string()),
        oneway: false,
        reversed: u > v,
        length: 10.0,
        geometry: line.into(),
    };
    let network = StreetNetwork {
        epsg: 28992,
        edges: vec![
            edge(1, 2, vec![(121_005.0, 487_010.0), (121_015.0, 487_010.0)]),
            edge(2, 1, vec![(121_015.0, 487_010.0), (121_005.0, 487_010.0)]),
        ],
    };

    let config = ZonalConfig {
        buffer_distance: 2.0,
        ..ZonalConfig::default()
    };
    let curve = AdjustmentCurve::from_weights(layout.interval_labels().into_iter().map(|l| (l, 1.0)));
    let metrics = ShadeMetrics::new(&layout, &curve, &TimeWindow::midday())?;

    let stats = sample_network(&config, &raster, &network)?;
    let mut enriched = EnrichedEdges::join(&network, &stats);
    enriched.normalise();
    enriched.compute_metrics(&metrics);

    let df = enriched.to_polars_df()?;
    println!("DataFrame created with {} rows and {} columns", df.height(), df.width());
    println!("{}", df);

    Ok(())
}
