//! `multipart/form-data` decoding with per-part limits.
use axum::body::Body;
use bytes::Bytes;
use multer::{Constraints, Multipart, SizeLimit};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::{
    config::models::PayloadLimits,
    core::{
        body::{BodyAccumulator, Push},
        error::HttpError,
        request::insert_repeated,
    },
};

/// A file part of a multipart body.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    #[serde(skip)]
    pub data: Bytes,
}

impl UploadedFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Decoded fields and files. Repeated field names collapse into arrays.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    pub fields: Map<String, Value>,
    pub files: Vec<UploadedFile>,
}

impl MultipartForm {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn file(&self, field_name: &str) -> Option<&UploadedFile> {
        self.files.iter().find(|f| f.field_name == field_name)
    }

    /// Fields plus a `files` array describing each upload (without contents).
    pub fn to_value(&self) -> Value {
        let mut value = self.fields.clone();
        let files = self
            .files
            .iter()
            .map(|f| {
                json!({
                    "field_name": f.field_name,
                    "file_name": f.file_name,
                    "content_type": f.content_type,
                    "size": f.size(),
                })
            })
            .collect();
        value.insert("files".to_string(), Value::Array(files));
        Value::Object(value)
    }
}

/// Decode a multipart body, aborting on the first limit breach.
pub async fn decode(
    body: Body,
    boundary: String,
    limits: &PayloadLimits,
) -> Result<MultipartForm, HttpError> {
    let constraints =
        Constraints::new().size_limit(SizeLimit::new().whole_stream(limits.max_bytes as u64));
    let mut multipart = Multipart::with_constraints(body.into_data_stream(), boundary, constraints);

    let mut form = MultipartForm::default();
    let mut parts = 0usize;
    let mut field_count = 0usize;

    while let Some(mut field) = multipart.next_field().await.map_err(map_multer_error)? {
        parts += 1;
        if parts > limits.max_parts {
            return Err(HttpError::payload_too_large(format!(
                "Multipart body has more than {} parts",
                limits.max_parts
            )));
        }

        let name = field.name().unwrap_or_default().to_string();
        if name.len() > limits.max_field_name_bytes {
            return Err(HttpError::bad_request(format!(
                "Multipart field name exceeds {} bytes",
                limits.max_field_name_bytes
            )));
        }

        let file_name = field.file_name().map(str::to_string);
        let is_file = file_name.is_some();
        let limit = if is_file {
            if form.files.len() >= limits.max_files {
                return Err(HttpError::payload_too_large(format!(
                    "Multipart body has more than {} files",
                    limits.max_files
                )));
            }
            limits.max_file_bytes
        } else {
            field_count += 1;
            if field_count > limits.max_fields {
                return Err(HttpError::payload_too_large(format!(
                    "Multipart body has more than {} fields",
                    limits.max_fields
                )));
            }
            limits.max_field_value_bytes
        };

        let mut acc = BodyAccumulator::new(limit);
        while let Some(chunk) = field.chunk().await.map_err(map_multer_error)? {
            if acc.push(&chunk) == Push::LimitExceeded {
                let what = if is_file { "File" } else { "Field value" };
                return Err(HttpError::payload_too_large(format!(
                    "{what} for '{name}' exceeds {limit} bytes"
                )));
            }
        }
        let data = acc.finish().unwrap_or_default();

        if is_file {
            form.files.push(UploadedFile {
                field_name: name,
                file_name,
                content_type: field.content_type().map(|m| m.to_string()),
                data,
            });
        } else {
            let value = String::from_utf8_lossy(&data).into_owned();
            insert_repeated(&mut form.fields, name, Value::String(value));
        }
    }

    Ok(form)
}

fn map_multer_error(err: multer::Error) -> HttpError {
    match err {
        multer::Error::StreamSizeExceeded { limit } => {
            HttpError::payload_too_large(format!("Request body exceeds {limit} bytes"))
        }
        multer::Error::FieldSizeExceeded { limit, field_name } => {
            HttpError::payload_too_large(format!(
                "Field '{}' exceeds {limit} bytes",
                field_name.unwrap_or_default()
            ))
        }
        other => HttpError::bad_request(format!("Malformed multipart body: {other}")),
    }
}
