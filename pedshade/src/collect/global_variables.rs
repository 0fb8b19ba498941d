use std::path::PathBuf;

pub const ROOT_FOLDER: &str = "./root";

pub const OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

/// Seconds granted to the Overpass server for a single query
pub const OVERPASS_TIMEOUT_SECS: u64 = 180;

pub fn get_root_path() -> PathBuf {
    PathBuf::from(ROOT_FOLDER)
}

/// `{ROOT_FOLDER}/{folder}/{file}`
pub fn root_file(folder: &str, file: &str) -> PathBuf {
    get_root_path().join(folder).join(file)
}
