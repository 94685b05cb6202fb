use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    response::IntoResponse,
};
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    api::images::{self, MAX_IMAGE_BYTES},
    platform::{
        app_error::{AppError, StdResponse},
        app_state::AppState,
    },
};

/// Room for multipart boundaries and headers around the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/uploads",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(upload_image))
            .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES + MULTIPART_OVERHEAD)),
    )
}

#[derive(Serialize, ToSchema, Debug)]
pub struct UploadedImage {
    pub url: String,
}

#[allow(dead_code)]
#[derive(ToSchema)]
struct UploadImageForm {
    #[schema(format = Binary, content_media_type = "application/octet-stream")]
    file: String,
}

/// Upload a menu or category image to the CDN. Send it as the `file` multipart field.
#[utoipa::path(
    post,
    path = "/images",
    tags = ["Admin"],
    security(("bearerAuth" = [])),
    request_body(content = UploadImageForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Uploaded image successfully", body = StdResponse<UploadedImage, String>),
        (status = 400, description = "Missing file, unsupported type or too large"),
        (status = 503, description = "Image CDN not configured or unreachable")
    )
)]
async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::BadRequest(err.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let content_type = field
            .content_type()
            .map(str::to_owned)
            .ok_or_else(|| AppError::BadRequest("file has no content type".into()))?;
        let file_name = field
            .file_name()
            .map(str::to_owned)
            .unwrap_or_else(|| "upload".into());
        let bytes = field
            .bytes()
            .await
            .map_err(|err| AppError::BadRequest(err.body_text()))?;

        let url = images::upload_image(
            &state.http_client,
            &state.config.image_cdn,
            file_name,
            &content_type,
            bytes.to_vec(),
        )
        .await?;

        tracing::info!("Uploaded image to {}", url);

        return Ok(StdResponse {
            data: Some(UploadedImage { url }),
            message: Some("Uploaded image successfully"),
        });
    }

    Err(AppError::BadRequest("Missing file field".into()))
}
