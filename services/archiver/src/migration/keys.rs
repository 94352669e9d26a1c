// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Deterministic remote keys
//!
//! Keys depend only on ids (and the attachment's file name), so a retried
//! upload overwrites the object written by an earlier attempt.

use archiver_types::{Attachment, Record};

/// Records per key shard.
pub const SHARD_SIZE: i64 = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    body_prefix: String,
    attachment_prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new("records/", "attachments/")
    }
}

impl KeyLayout {
    pub fn new(body_prefix: &str, attachment_prefix: &str) -> Self {
        Self {
            body_prefix: normalize_prefix(body_prefix),
            attachment_prefix: normalize_prefix(attachment_prefix),
        }
    }

    /// `{prefix}{id / 1000}/{id}.{ext}`
    pub fn body_key(&self, record: &Record) -> String {
        format!(
            "{}{}/{}.{}",
            self.body_prefix,
            record.id / SHARD_SIZE,
            record.id,
            extension_for(&record.content_type)
        )
    }

    /// `{prefix}{id / 1000}/{id}/{file name}`
    pub fn attachment_key(&self, attachment: &Attachment) -> String {
        format!(
            "{}{}/{}/{}",
            self.attachment_prefix,
            attachment.id / SHARD_SIZE,
            attachment.id,
            file_name(&attachment.name)
        )
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "text/html" => "html",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "application/json" => "json",
        "message/rfc822" => "eml",
        _ => "bin",
    }
}

/// Last path component of `name`, without control characters.
fn file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    match cleaned.as_str() {
        "" | "." | ".." => "attachment".to_string(),
        _ => cleaned,
    }
}
