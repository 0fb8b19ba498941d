use anyhow::Result;
use geo::MultiPolygon;
use pedshade::collect::overpass::overpass_collect::load_network_data;
use pedshade::config::NetworkSource;
use pedshade::geo_core::{BoundingBox, EPSG_RD_NEW};
use pedshade::geometric::street_network::{StreetNetwork, WayFilter};

/// Example: pedestrian network of a few Amsterdam blocks from the Overpass API
fn main() -> Result<()> {
    pretty_env_logger::init();
    println!("=== Example: Walk network from Overpass ===\n");

    // Around the Dam, Amsterdam (N, S, E, W)
    let bbox = BoundingBox::from_nsew([52.3745, 52.3715, 4.8960, 4.8910]);
    let aoi = MultiPolygon::new(vec![bbox.to_polygon()]);
    let filter = WayFilter::default();

    println!("Overpass filter: {}", filter.to_overpass_filter());
    let osm = load_network_data(&NetworkSource::default(), &aoi, &filter)?;
    let network = StreetNetwork::from_overpass(&osm, &aoi, &filter)?;
    println!("  - Edges: {}", network.len());

    let projected = network.to_crs(EPSG_RD_NEW)?;
    let zones = projected.sampling_zones(10.0)?;
    println!("  - Sampling zones: {}", zones.len());

    let output = std::path::Path::new("./output/walk_network.geojson");
    network.to_feature_table().write(output, "walk_network")?;
    println!("\nSaved edges to {:?}", output);

    Ok(())
}
