use anyhow::Context;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::Deserialize;

use crate::platform::{app_error::AppError, config::ImageCdnConfig};

pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const ALLOWED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

#[derive(Deserialize, Debug)]
struct UploadRes {
    url: String,
}

pub fn validate_image(content_type: &str, len: usize) -> Result<(), AppError> {
    if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
        return Err(AppError::BadRequest(format!(
            "{content_type} is not a supported image type"
        )));
    }
    if len == 0 {
        return Err(AppError::BadRequest("Image is empty".into()));
    }
    if len > MAX_IMAGE_BYTES {
        return Err(AppError::BadRequest("Image exceeds 5 MiB".into()));
    }
    Ok(())
}

/// Uploads an image to the CDN and returns its public URL.
pub async fn upload_image(
    client: &Client,
    config: &ImageCdnConfig,
    file_name: String,
    content_type: &str,
    bytes: Vec<u8>,
) -> Result<String, AppError> {
    validate_image(content_type, bytes.len())?;

    let url = config
        .upload_url
        .as_deref()
        .ok_or_else(|| AppError::ServiceUnreachable("ImageCdn".into()))?;

    let part = Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(content_type)
        .context("Invalid content type")?;
    let form = Form::new().part("file", part);

    let mut request = client.post(url).multipart(form);
    if let Some(api_key) = &config.api_key {
        request = request.bearer_auth(api_key);
    }

    let uploaded: UploadRes = request
        .send()
        .await
        .map_err(|_| AppError::ServiceUnreachable("ImageCdn".into()))?
        .error_for_status()
        .context("Image CDN rejected the upload")?
        .json()
        .await
        .context("Failed to parse JSON")?;

    Ok(uploaded.url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_image_types() {
        assert!(validate_image("image/png", 1024).is_ok());
        assert!(validate_image("image/webp", MAX_IMAGE_BYTES).is_ok());
    }

    #[test]
    fn rejects_other_types_and_sizes() {
        assert!(validate_image("application/pdf", 1024).is_err());
        assert!(validate_image("image/png", 0).is_err());
        assert!(validate_image("image/png", MAX_IMAGE_BYTES + 1).is_err());
    }
}
