pub mod materialisation;
pub mod shade_metrics;
pub mod shade_pet;
pub mod street_network;
pub mod zonal_stats;
