use serde::Deserialize;

/// Place Details response, restricted to the fields the pipeline requests.
#[derive(Deserialize, Debug)]
pub struct DetailsResponse {
    pub status: String,
    #[serde(default)]
    pub result: Option<DetailsResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct DetailsResult {
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub user_ratings_total: Option<u64>,
    #[serde(default)]
    pub photos: Vec<PhotoEntry>,
}

#[derive(Deserialize, Debug)]
pub struct PhotoEntry {
    pub photo_reference: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub html_attributions: Vec<String>,
}
