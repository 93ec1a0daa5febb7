//! Multipart form container and payload flattening.
//!
//! # Design
//! `FormData` is an ordered list of `(key, value)` parts, mirroring an
//! append-only multipart builder. Transports turn it into their own multipart
//! type at send time, which lets them set the boundary header themselves.
//!
//! Flattening rules: nested object keys are dot-joined (`user.name`), array
//! elements get an index suffix (`tags[0]`), file leaves become binary parts
//! and every other leaf is stringified. Null entries are stripped from
//! objects first; nulls inside arrays are kept and stringify to `"null"`.

use crate::payload::{strip_nulls, FilePart, Payload};

/// One multipart part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File(FilePart),
}

impl FormValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FilePart> {
        match self {
            Self::File(f) => Some(f),
            Self::Text(_) => None,
        }
    }
}

/// Ordered multipart form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    entries: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: FormValue) {
        self.entries.push((key.into(), value));
    }

    pub fn append_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.append(key, FormValue::Text(value.into()));
    }

    pub fn append_file(&mut self, key: impl Into<String>, file: FilePart) {
        self.append(key, FormValue::File(file));
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&FormValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn entries(&self) -> &[(String, FormValue)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Convert into a reqwest multipart form.
    pub fn into_multipart(self) -> Result<reqwest::multipart::Form, reqwest::Error> {
        let mut form = reqwest::multipart::Form::new();
        for (key, value) in self.entries {
            form = match value {
                FormValue::Text(text) => form.text(key, text),
                FormValue::File(file) => {
                    let mut part =
                        reqwest::multipart::Part::bytes(file.bytes.to_vec()).file_name(file.name);
                    if let Some(content_type) = file.content_type.as_deref() {
                        part = part.mime_str(content_type)?;
                    }
                    form.part(key, part)
                }
            };
        }
        Ok(form)
    }
}

/// Flatten a payload into a multipart form.
pub fn to_form_data(payload: &Payload) -> FormData {
    let mut form = FormData::new();
    append_payload(payload, &mut form, None);
    form
}

fn append_payload(payload: &Payload, form: &mut FormData, parent: Option<&str>) {
    let cleaned = strip_nulls(payload);
    let children: Vec<(String, &Payload)> = match &cleaned {
        Payload::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Payload::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v))
            .collect(),
        _ => return,
    };

    for (key, value) in children {
        let form_key = match parent {
            Some(parent) => format!("{parent}.{key}"),
            None => key,
        };
        match value {
            Payload::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let item_key = format!("{form_key}[{index}]");
                    match item {
                        Payload::File(file) => form.append_file(item_key, file.clone()),
                        Payload::Object(_) | Payload::Array(_) => {
                            append_payload(item, form, Some(&item_key))
                        }
                        scalar => form.append_text(item_key, scalar.scalar_string()),
                    }
                }
            }
            Payload::File(file) => form.append_file(form_key, file.clone()),
            Payload::Object(_) => append_payload(value, form, Some(&form_key)),
            scalar => form.append_text(form_key, scalar.scalar_string()),
        }
    }
}
