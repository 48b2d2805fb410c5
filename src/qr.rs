use data_encoding::BASE64;
use thiserror::Error;

use crate::model::id::{SurveyId, UserId};

/// Edge length, in pixels, of generated QR images.
pub const IMAGE_SIZE: u32 = 512;

/// How much damage a QR code survives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EcLevel {
    Low,
    Medium,
    Quartile,
    High,
}

#[derive(Debug, Error)]
#[error("could not create QR code: {0}")]
pub struct QrError(pub String);

/// Turns text into a QR code image. Image encoding is not our business, so
/// whoever builds the registry supplies the implementation.
pub trait QrEncoder: Send + Sync {
    /// Encode `content` as an image `size` pixels wide.
    fn encode(&self, content: &str, level: EcLevel, size: u32) -> Result<Vec<u8>, QrError>;
}

/// Encode `content` and return the image as base64, ready to embed in a page.
pub fn payload(encoder: &dyn QrEncoder, content: &str) -> Result<String, QrError> {
    let image = encoder.encode(content, EcLevel::Medium, IMAGE_SIZE)?;
    Ok(BASE64.encode(&image))
}

/// Where voters go to vote on a survey.
pub fn vote_url(host: &str, survey_id: &SurveyId) -> String {
    format!("{host}/vote/?id={survey_id}")
}

/// Lets the creator continue managing a survey from another device.
pub fn handover_url(host: &str, creator: &UserId, survey_id: &SurveyId) -> String {
    format!("{host}/?tuid={creator}&tsid={survey_id}")
}
