//! Shared data model: the parsed email, attachment projections, and the
//! durable task envelope that travels from ingestion through dispatch.
//!
//! Kept free of back-pointers or cyclic references on purpose (see the
//! design's "cyclic/shared references" note) — every type here is a plain
//! value that can be cloned, serialized, and round-tripped through the
//! durable queue without any notion of object identity beyond string ids.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single MIME attachment as extracted from the raw message, before it
/// has been committed to any storage backend.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub bytes: Vec<u8>,
}

/// The outcome of attempting to durably store one [`Attachment`]. A plain
/// tagged enum — no shared references back to the attachment or the email.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredAttachment {
    Object {
        url: String,
    },
    Local {
        path: String,
        attachment_id: String,
        note: String,
    },
    Skipped {
        reason: String,
    },
    Failed {
        error: String,
    },
}

/// The attachment projection embedded into outbound webhook JSON
/// (`attachmentInfo` entries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub filename: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub size: usize,
    pub location: Option<String>,
    #[serde(rename = "storageType")]
    pub storage_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(rename = "attachmentId", skip_serializing_if = "Option::is_none")]
    pub attachment_id: Option<String>,
}

impl AttachmentInfo {
    /// Projects a [`StoredAttachment`] into the wire-facing shape. Returns
    /// `None` for `Skipped`/`Failed` outcomes, which are tracked separately.
    pub fn from_stored(filename: &str, content_type: &str, size: usize, stored: &StoredAttachment) -> Option<Self> {
        match stored {
            StoredAttachment::Object { url } => Some(AttachmentInfo {
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                size,
                location: Some(url.clone()),
                storage_type: "s3".to_string(),
                note: None,
                attachment_id: None,
            }),
            StoredAttachment::Local { attachment_id, .. } => Some(AttachmentInfo {
                filename: filename.to_string(),
                content_type: content_type.to_string(),
                size,
                location: None,
                storage_type: "local".to_string(),
                note: Some(
                    "Temporarily stored locally, will be uploaded to S3 when available".to_string(),
                ),
                attachment_id: Some(attachment_id.clone()),
            }),
            StoredAttachment::Skipped { .. } | StoredAttachment::Failed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedAttachment {
    pub filename: String,
    pub size: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSummary {
    pub total: usize,
    #[serde(rename = "uploadedToS3")]
    pub uploaded_to_s3: usize,
    #[serde(rename = "storedLocally")]
    pub stored_locally: usize,
    pub skipped: usize,
}

/// A single named address, following the `{address, name}` shape common to
/// inbound-email address parsing libraries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmailAddress {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An address field (`from`/`to`/`cc`) as it appears in the outbound JSON:
/// a list of structured addresses plus a rendered text form, matching the
/// `{value:[{address,name}], text}` shape the router's field resolution
/// (spec §4.2) is written to accept.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AddressList {
    pub value: Vec<EmailAddress>,
    pub text: String,
}

impl AddressList {
    pub fn single(address: impl Into<String>, name: Option<String>) -> Self {
        let address = address.into();
        let text = match &name {
            Some(n) => format!("{n} <{address}>"),
            None => address.clone(),
        };
        AddressList {
            value: vec![EmailAddress { address, name }],
            text,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// Header values keyed case-insensitively, preserving every occurrence of a
/// repeated header (a multi-map), per the data model's header requirement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeaderMap(BTreeMap<String, Vec<String>>);

impl HeaderMap {
    pub fn insert(&mut self, name: &str, value: String) {
        self.0.entry(name.to_lowercase()).or_default().push(value);
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

/// The fully parsed inbound email, matching the JSON schema in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEmail {
    pub from: AddressList,
    pub to: AddressList,
    #[serde(default, skip_serializing_if = "AddressList::is_empty")]
    pub cc: AddressList,
    pub subject: String,
    pub text: String,
    pub html: String,
    pub headers: HeaderMap,
    #[serde(rename = "attachmentInfo")]
    pub attachment_info: Vec<AttachmentInfo>,
    #[serde(rename = "skippedAttachments")]
    pub skipped_attachments: Vec<SkippedAttachment>,
    #[serde(rename = "storageSummary", skip_serializing_if = "Option::is_none")]
    pub storage_summary: Option<StorageSummary>,
}

impl ParsedEmail {
    pub fn has_attachments(&self) -> bool {
        !self.attachment_info.is_empty()
    }
}

/// One durable unit of webhook work, covering a single parsed email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub parsed: ParsedEmail,
    #[serde(rename = "failedWebhooks", skip_serializing_if = "Option::is_none")]
    pub failed_webhooks: Option<Vec<String>>,
    pub attempts: u32,
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Generates a monotonically-sortable task/attachment id:
/// `<millis since epoch>-<n hex chars>`.
pub fn generate_id(hex_len: usize) -> String {
    format!("{}-{}", now_millis(), random_hex(hex_len))
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `len` hex characters of cryptographically-unrelated randomness, sourced
/// from a v4 UUID's 128 bits (capped at 32 hex chars).
pub fn random_hex(len: usize) -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    full.chars().take(len.min(32)).collect()
}
