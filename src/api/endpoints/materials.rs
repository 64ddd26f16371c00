//! `POST /api/materials/:id/extract`: extract and persist a stored material.

use axum::extract::{Path, State};
use axum::Json;

use crate::api::endpoints::RequestDeadline;
use crate::api::error::ApiError;
use crate::api::types::{ApiContext, MaterialExtractResponse};

pub async fn extract_material(
    State(ctx): State<ApiContext>,
    Path(material_id): Path<String>,
) -> Result<Json<MaterialExtractResponse>, ApiError> {
    let deadline = RequestDeadline::start(ctx.config.extraction_timeout);
    let summary = ctx.processor.process(&material_id, deadline.token()).await?;

    Ok(Json(MaterialExtractResponse {
        success: true,
        summary,
    }))
}
