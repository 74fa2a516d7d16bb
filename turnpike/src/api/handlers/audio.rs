//! `POST /v1/audio/{transcriptions,translations,speech}`.

use axum::{
    Extension, Json,
    extract::{Multipart, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use bytes::Bytes;

use crate::AppState;
use crate::api::AppJson;
use crate::api::budget_headers;
use crate::auth::AuthContext;
use crate::dispatch::Reply;
use crate::errors::{Error, Result};
use crate::openai::{AudioTranscriptionRequest, SpeechRequest};

async fn read_audio_form(mut multipart: Multipart) -> Result<AudioTranscriptionRequest> {
    let mut model = None;
    let mut file: Option<(Bytes, String)> = None;
    let mut language = None;
    let mut prompt = None;
    let mut response_format = None;
    let mut temperature = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| Error::InvalidRequest {
        message: format!("malformed multipart body: {e}"),
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("audio").to_string();
                let data = field.bytes().await.map_err(|e| Error::InvalidRequest {
                    message: format!("failed to read audio file: {e}"),
                })?;
                file = Some((data, filename));
            }
            "model" => model = Some(read_text(field).await?),
            "language" => language = Some(read_text(field).await?),
            "prompt" => prompt = Some(read_text(field).await?),
            "response_format" => response_format = Some(read_text(field).await?),
            "temperature" => {
                let raw = read_text(field).await?;
                temperature = Some(raw.parse().map_err(|_| Error::InvalidRequest {
                    message: format!("temperature must be a number, got `{raw}`"),
                })?);
            }
            _ => {}
        }
    }

    let (file, filename) = file.ok_or_else(|| Error::InvalidRequest {
        message: "audio requests require a `file` part".to_string(),
    })?;
    let model = model.ok_or_else(|| Error::InvalidRequest {
        message: "audio requests require a `model`".to_string(),
    })?;

    Ok(AudioTranscriptionRequest {
        model,
        file,
        filename,
        language,
        prompt,
        response_format,
        temperature,
    })
}

async fn read_text(field: axum::extract::multipart::Field<'_>) -> Result<String> {
    field.text().await.map_err(|e| Error::InvalidRequest {
        message: format!("malformed multipart field: {e}"),
    })
}

pub async fn transcriptions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    multipart: Multipart,
) -> Result<Response> {
    let req = read_audio_form(multipart).await?;
    let outcome = state.dispatcher.transcribe(&ctx, &req).await?;
    let body = match outcome.reply {
        Reply::Fresh(body) => body,
        Reply::Cached(_) => unreachable!("audio operations bypass the idempotency cache"),
    };
    let mut response = Json(body).into_response();
    for (name, value) in budget_headers(&outcome.snapshot) {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

pub async fn translations(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    multipart: Multipart,
) -> Result<Response> {
    let req = read_audio_form(multipart).await?;
    let outcome = state.dispatcher.translate_audio(&ctx, &req).await?;
    let body = match outcome.reply {
        Reply::Fresh(body) => body,
        Reply::Cached(_) => unreachable!("audio operations bypass the idempotency cache"),
    };
    let mut response = Json(body).into_response();
    for (name, value) in budget_headers(&outcome.snapshot) {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

pub async fn speech(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AppJson(req): AppJson<SpeechRequest>,
) -> Result<Response> {
    let outcome = state.dispatcher.speech(&ctx, &req).await?;
    let audio = match outcome.reply {
        Reply::Fresh(audio) => audio,
        Reply::Cached(_) => unreachable!("audio operations bypass the idempotency cache"),
    };

    let content_type = match req.response_format.as_deref() {
        Some("opus") => "audio/opus",
        Some("aac") => "audio/aac",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        Some("pcm") => "audio/pcm",
        _ => "audio/mpeg",
    };
    let mut response = ([(CONTENT_TYPE, content_type)], audio).into_response();
    for (name, value) in budget_headers(&outcome.snapshot) {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}
