//! `POST /v1/images/{generations,edits,variations}`.
//!
//! Generations are JSON; edits and variations arrive as multipart with the
//! image (and optional mask) riding alongside the form fields.

use axum::{
    Extension, Json,
    extract::{Multipart, State},
    response::Response,
};
use bytes::Bytes;

use crate::AppState;
use crate::api::AppJson;
use crate::auth::AuthContext;
use crate::dispatch::{Outcome, Reply};
use crate::errors::{Error, Result};
use crate::openai::{
    ImageEditRequest, ImageGenerationRequest, ImageResponse, ImageResponseFormat,
    ImageVariationRequest,
};

use super::super::budget_headers;

fn respond(outcome: Outcome<ImageResponse>) -> Result<Response> {
    let response = match outcome.reply {
        Reply::Fresh(response) => response,
        Reply::Cached(_) => unreachable!("image operations bypass the idempotency cache"),
    };
    let mut http = axum::response::IntoResponse::into_response(Json(response));
    for (name, value) in budget_headers(&outcome.snapshot) {
        if let Ok(value) = value.parse() {
            http.headers_mut().insert(name, value);
        }
    }
    Ok(http)
}

pub async fn generations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AppJson(req): AppJson<ImageGenerationRequest>,
) -> Result<Response> {
    let alias = req.model.clone().ok_or_else(|| Error::InvalidRequest {
        message: "image generation requires a model".to_string(),
    })?;
    respond(state.dispatcher.image_generation(&ctx, &alias, &req).await?)
}

/// Accumulated multipart fields shared by edits and variations.
#[derive(Default)]
struct ImageForm {
    model: Option<String>,
    prompt: Option<String>,
    image: Option<(Bytes, String)>,
    mask: Option<Bytes>,
    n: Option<u32>,
    size: Option<String>,
    response_format: Option<ImageResponseFormat>,
}

async fn read_image_form(mut multipart: Multipart) -> Result<ImageForm> {
    let mut form = ImageForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::InvalidRequest {
        message: format!("malformed multipart body: {e}"),
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let filename = field.file_name().unwrap_or("image.png").to_string();
                let data = field.bytes().await.map_err(|e| Error::InvalidRequest {
                    message: format!("failed to read image: {e}"),
                })?;
                form.image = Some((data, filename));
            }
            "mask" => {
                let data = field.bytes().await.map_err(|e| Error::InvalidRequest {
                    message: format!("failed to read mask: {e}"),
                })?;
                form.mask = Some(data);
            }
            "model" => form.model = Some(text(field).await?),
            "prompt" => form.prompt = Some(text(field).await?),
            "n" => {
                let raw = text(field).await?;
                form.n = Some(raw.parse().map_err(|_| Error::InvalidRequest {
                    message: format!("n must be an integer, got `{raw}`"),
                })?);
            }
            "size" => form.size = Some(text(field).await?),
            "response_format" => {
                let raw = text(field).await?;
                form.response_format = Some(match raw.as_str() {
                    "url" => ImageResponseFormat::Url,
                    "b64_json" => ImageResponseFormat::B64Json,
                    other => {
                        return Err(Error::InvalidRequest {
                            message: format!("response_format must be url or b64_json, got `{other}`"),
                        });
                    }
                });
            }
            _ => {}
        }
    }

    Ok(form)
}

async fn text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field.text().await.map_err(|e| Error::InvalidRequest {
        message: format!("malformed multipart field: {e}"),
    })
}

pub async fn edits(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    multipart: Multipart,
) -> Result<Response> {
    let form = read_image_form(multipart).await?;
    let (image, image_filename) = form.image.ok_or_else(|| Error::InvalidRequest {
        message: "image edits require an `image` part".to_string(),
    })?;
    let prompt = form.prompt.ok_or_else(|| Error::InvalidRequest {
        message: "image edits require a `prompt`".to_string(),
    })?;
    let alias = form.model.clone().ok_or_else(|| Error::InvalidRequest {
        message: "image edits require a `model`".to_string(),
    })?;

    let req = ImageEditRequest {
        model: form.model,
        prompt,
        image,
        image_filename,
        mask: form.mask,
        n: form.n,
        size: form.size,
        response_format: form.response_format,
    };
    respond(state.dispatcher.image_edit(&ctx, &alias, &req).await?)
}

pub async fn variations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    multipart: Multipart,
) -> Result<Response> {
    let form = read_image_form(multipart).await?;
    let (image, image_filename) = form.image.ok_or_else(|| Error::InvalidRequest {
        message: "image variations require an `image` part".to_string(),
    })?;
    let alias = form.model.clone().ok_or_else(|| Error::InvalidRequest {
        message: "image variations require a `model`".to_string(),
    })?;

    let req = ImageVariationRequest {
        model: form.model,
        image,
        image_filename,
        n: form.n,
        size: form.size,
        response_format: form.response_format,
    };
    respond(state.dispatcher.image_variation(&ctx, &alias, &req).await?)
}
