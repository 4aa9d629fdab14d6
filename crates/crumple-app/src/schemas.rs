use serde::{Deserialize, Serialize};
use crumple_core::TransformRequest;
use crumple_core::image_data::strip_data_uri;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformApiRequest {
    pub model: String,
    pub prompt: String,
    /// Bare base64, no data-URI prefix
    pub image: String,
    pub strength: f32,
    pub steps: u32,
    pub guidance_scale: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl TransformApiRequest {
    pub fn new(model: &str, request: &TransformRequest) -> Self {
        let params = &request.params;
        Self {
            model: model.to_string(),
            prompt: params.prompt.clone(),
            image: strip_data_uri(&request.image).to_string(),
            strength: params.strength,
            steps: params.steps,
            guidance_scale: params.guidance_scale,
            width: params.width,
            height: params.height,
            seed: params.seed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformApiResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    pub data: Option<TransformApiData>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformApiData {
    /// Bare base64
    pub image: String,
    pub seed: u64,
}
