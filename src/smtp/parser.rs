//! Decodes a raw MIME message (the bytes collected during `DATA`) into a
//! [`ParsedEmail`], committing each attachment to the storage tier
//! independently so one bad attachment never fails the rest of the message.

use mailparse::{parse_mail, MailHeaderMap, ParsedMail};

use crate::model::{
    AddressList, AttachmentInfo, EmailAddress, HeaderMap, ParsedEmail, SkippedAttachment,
    StorageSummary,
};
use crate::storage::AttachmentStore;

/// One MIME attachment pulled out of the message tree, not yet committed to
/// any storage backend.
struct RawAttachment {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
}

/// Parses `raw` (the full RFC 5322 message) and stores any attachments
/// through `store`, returning the [`ParsedEmail`] ready to embed in a
/// [`crate::model::Task`].
pub async fn parse(raw: &[u8], store: &AttachmentStore, max_file_size: usize) -> anyhow::Result<ParsedEmail> {
    let mail = parse_mail(raw)?;

    let from = address_list_from_header(&mail, "From");
    let to = address_list_from_header(&mail, "To");
    let cc = address_list_from_header(&mail, "Cc");
    let subject = header_value(&mail, "Subject").unwrap_or_default();

    let text = extract_text_body(&mail).unwrap_or_default();
    let html = extract_html_body(&mail).unwrap_or_default();
    let text = if text.is_empty() && !html.is_empty() {
        html2text::from_read(html.as_bytes(), 80)
    } else {
        text
    };

    let headers = collect_headers(&mail);

    let mut raw_attachments = Vec::new();
    collect_attachments(&mail, &mut raw_attachments);

    let mut attachment_info = Vec::new();
    let mut skipped_attachments = Vec::new();
    let mut uploaded_to_s3 = 0usize;
    let mut stored_locally = 0usize;
    let mut skipped = 0usize;

    for raw_attachment in &raw_attachments {
        let size = raw_attachment.bytes.len();

        if size > max_file_size {
            skipped += 1;
            skipped_attachments.push(SkippedAttachment {
                filename: raw_attachment.filename.clone(),
                size,
                reason: "File size exceeds maximum allowed".to_string(),
            });
            continue;
        }

        let stored = store
            .store(&raw_attachment.filename, &raw_attachment.content_type, raw_attachment.bytes.clone())
            .await;

        if let Some(info) = AttachmentInfo::from_stored(&raw_attachment.filename, &raw_attachment.content_type, size, &stored) {
            match info.storage_type.as_str() {
                "s3" => uploaded_to_s3 += 1,
                "local" => stored_locally += 1,
                _ => {}
            }
            attachment_info.push(info);
        } else {
            skipped += 1;
            let reason = match &stored {
                crate::model::StoredAttachment::Skipped { reason } => reason.clone(),
                crate::model::StoredAttachment::Failed { error } => error.clone(),
                _ => "unknown storage failure".to_string(),
            };
            skipped_attachments.push(SkippedAttachment {
                filename: raw_attachment.filename.clone(),
                size,
                reason,
            });
        }
    }

    let total = raw_attachments.len();
    let storage_summary = if total > 0 {
        Some(StorageSummary {
            total,
            uploaded_to_s3,
            stored_locally,
            skipped,
        })
    } else {
        None
    };

    Ok(ParsedEmail {
        from,
        to,
        cc,
        subject,
        text,
        html,
        headers,
        attachment_info,
        skipped_attachments,
        storage_summary,
    })
}

fn header_value(mail: &ParsedMail<'_>, key: &str) -> Option<String> {
    mail.headers.get_first_value(key)
}

fn collect_headers(mail: &ParsedMail<'_>) -> HeaderMap {
    let mut headers = HeaderMap::default();
    for header in &mail.headers {
        headers.insert(header.get_key_ref(), header.get_value());
    }
    headers
}

/// Parses an address-list header (`From`/`To`/`Cc`) into an [`AddressList`].
/// mailparse's `addrparse` understands RFC 5322 group/mailbox syntax and
/// comma-separated lists directly.
fn address_list_from_header(mail: &ParsedMail<'_>, key: &str) -> AddressList {
    let Some(raw) = header_value(mail, key) else {
        return AddressList::default();
    };

    let text = raw.clone();
    let value = match mailparse::addrparse(&raw) {
        Ok(addrs) => addrs
            .iter()
            .flat_map(flatten_address)
            .collect(),
        Err(_) => Vec::new(),
    };

    AddressList { value, text }
}

fn flatten_address(addr: &mailparse::MailAddr) -> Vec<EmailAddress> {
    match addr {
        mailparse::MailAddr::Single(info) => vec![EmailAddress {
            address: info.addr.clone(),
            name: info.display_name.clone(),
        }],
        mailparse::MailAddr::Group(group) => group
            .addrs
            .iter()
            .map(|info| EmailAddress {
                address: info.addr.clone(),
                name: info.display_name.clone(),
            })
            .collect(),
    }
}

fn extract_text_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if content_type == "text/plain" {
            return mail.get_body().ok();
        }
        return None;
    }
    for part in &mail.subparts {
        if let Some(text) = extract_text_body(part) {
            return Some(text);
        }
    }
    None
}

fn extract_html_body(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        let content_type = mail.ctype.mimetype.to_ascii_lowercase();
        if content_type == "text/html" {
            return mail.get_body().ok();
        }
        return None;
    }
    for part in &mail.subparts {
        if let Some(html) = extract_html_body(part) {
            return Some(html);
        }
    }
    None
}

fn collect_attachments(mail: &ParsedMail<'_>, out: &mut Vec<RawAttachment>) {
    if mail.subparts.is_empty() {
        let disposition = header_value(mail, "Content-Disposition")
            .unwrap_or_default()
            .to_ascii_lowercase();
        let name = header_filename(&disposition).or_else(|| mail.ctype.params.get("name").cloned());
        let is_attachment = disposition.contains("attachment") || (disposition.contains("inline") && name.is_some());

        if is_attachment {
            if let Ok(bytes) = mail.get_body_raw() {
                out.push(RawAttachment {
                    filename: name.unwrap_or_else(|| "attachment.bin".to_string()),
                    content_type: mail.ctype.mimetype.clone(),
                    bytes,
                });
            }
        }
        return;
    }
    for part in &mail.subparts {
        collect_attachments(part, out);
    }
}

fn header_filename(disposition: &str) -> Option<String> {
    let key = "filename=";
    let idx = disposition.find(key)?;
    let raw = disposition[idx + key.len()..].trim();

    if let Some(stripped) = raw.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }

    raw.split(';').next().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;

    fn test_config(dir: &std::path::Path) -> Config {
        std::env::set_var("WEBHOOK_URL", "https://example.com/hook");
        std::env::set_var("LOCAL_STORAGE_PATH", dir.to_str().unwrap());
        let config = Config::from_env().unwrap();
        std::env::remove_var("WEBHOOK_URL");
        std::env::remove_var("LOCAL_STORAGE_PATH");
        config
    }

    #[tokio::test]
    async fn parses_plain_text_message_with_no_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let store = AttachmentStore::new(config).await;

        let raw = b"From: a@example.com\r\nTo: b@example.com\r\nSubject: hi\r\nContent-Type: text/plain\r\n\r\nhello world\r\n";
        let parsed = parse(raw, &store, 10_000_000).await.unwrap();

        assert_eq!(parsed.subject, "hi");
        assert_eq!(parsed.from.value[0].address, "a@example.com");
        assert!(parsed.text.contains("hello world"));
        assert!(parsed.storage_summary.is_none());
    }

    #[tokio::test]
    async fn oversized_attachment_is_skipped_without_touching_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(dir.path()));
        let store = AttachmentStore::new(config).await;

        let raw = concat!(
            "From: a@example.com\r\n",
            "To: b@example.com\r\n",
            "Subject: with attachment\r\n",
            "Content-Type: multipart/mixed; boundary=XYZ\r\n\r\n",
            "--XYZ\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "body text\r\n",
            "--XYZ\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Disposition: attachment; filename=\"big.bin\"\r\n\r\n",
            "0123456789\r\n",
            "--XYZ--\r\n",
        );
        let parsed = parse(raw.as_bytes(), &store, 5).await.unwrap();

        assert_eq!(parsed.skipped_attachments.len(), 1);
        assert_eq!(parsed.skipped_attachments[0].filename, "big.bin");
        assert_eq!(parsed.storage_summary.as_ref().unwrap().skipped, 1);
    }
}
