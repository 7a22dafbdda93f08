//! S3-style bucket listing shared by the storage backends.
//!
//! The listing is non-authoritative; backends enumerate whatever keys they
//! currently hold and this module applies prefix/marker/delimeter filtering
//! and renders the `ListBucketResult` XML.

use crate::response::Response;
use crate::storage::ListParams;

/// One key a backend knows about.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// Applies listing parameters to a set of entries and renders the reply.
///
/// `entries` need not be sorted; keys are ordered lexicographically as S3
/// clients expect. The `delimeter` spelling follows the query parameter.
pub fn build_listing(bucket: &str, params: &ListParams, mut entries: Vec<ObjectEntry>) -> Response {
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    let mut contents: Vec<ObjectEntry> = Vec::new();
    let mut common_prefixes: Vec<String> = Vec::new();
    let mut truncated = false;

    for entry in entries {
        if !params.prefix.is_empty() && !entry.key.starts_with(&params.prefix) {
            continue;
        }
        if !params.marker.is_empty() && entry.key.as_str() <= params.marker.as_str() {
            continue;
        }

        if !params.delimeter.is_empty() {
            let remainder = &entry.key[params.prefix.len()..];
            if let Some(end) = remainder.find(&params.delimeter) {
                let prefix = format!(
                    "{}{}{}",
                    params.prefix,
                    &remainder[..end],
                    params.delimeter
                );
                if common_prefixes.last() != Some(&prefix) {
                    common_prefixes.push(prefix);
                }
                continue;
            }
        }

        if contents.len() >= params.max_keys {
            truncated = true;
            break;
        }
        contents.push(entry);
    }

    let next_marker = if truncated {
        contents.last().map(|entry| entry.key.clone())
    } else {
        None
    };

    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">"#,
    );
    xml.push_str(&format!("<Name>{}</Name>", xml_escape(bucket)));
    xml.push_str(&format!("<Prefix>{}</Prefix>", xml_escape(&params.prefix)));
    xml.push_str(&format!("<Marker>{}</Marker>", xml_escape(&params.marker)));
    xml.push_str(&format!("<MaxKeys>{}</MaxKeys>", params.max_keys));
    if !params.delimeter.is_empty() {
        xml.push_str(&format!(
            "<Delimiter>{}</Delimiter>",
            xml_escape(&params.delimeter)
        ));
    }
    xml.push_str(&format!(
        "<IsTruncated>{}</IsTruncated>",
        if truncated { "true" } else { "false" }
    ));
    if let Some(marker) = next_marker {
        xml.push_str(&format!("<NextMarker>{}</NextMarker>", xml_escape(&marker)));
    }

    for entry in &contents {
        xml.push_str("<Contents>");
        xml.push_str(&format!("<Key>{}</Key>", xml_escape(&entry.key)));
        xml.push_str(&format!("<Size>{}</Size>", entry.size));
        xml.push_str("<StorageClass>STANDARD</StorageClass>");
        xml.push_str("</Contents>");
    }

    for prefix in &common_prefixes {
        xml.push_str("<CommonPrefixes><Prefix>");
        xml.push_str(&xml_escape(prefix));
        xml.push_str("</Prefix></CommonPrefixes>");
    }

    xml.push_str("</ListBucketResult>");

    Response::text(200, xml).with_content_type("application/xml")
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
