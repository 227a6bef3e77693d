//! OPML outline loading for bulk feed subscription.
//!
//! Outlines are loaded from `.opml`/`.xml` files as XML, or from `.json`
//! files as a JSON object whose `"opml"` key holds the outline. The XML
//! parser collects every `<outline>` element at any depth in document
//! order, so grouped exports (folders of feeds) flatten naturally.

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("could not read outline file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid XML in outline file: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid JSON in outline file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unhandled outline extension {0:?}")]
    UnknownExtension(String),
}

/// A parsed OPML document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Opml {
    pub version: String,
    pub head: Head,
    pub body: Body,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Head {
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Body {
    pub outlines: Vec<Outline>,
}

/// One outline entry. Feed outlines carry `xmlUrl` (and usually `htmlUrl`);
/// grouping outlines carry neither and, in JSON exports, nest children.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Outline {
    pub text: String,
    pub title: String,
    #[serde(rename = "type")]
    pub outline_type: String,
    pub xml_url: String,
    pub html_url: String,
    pub outlines: Vec<Outline>,
}

/// Loads an outline from disk, dispatching on the file extension.
///
/// # Errors
///
/// - [`OpmlError::Io`] - The file cannot be read
/// - [`OpmlError::Xml`] / [`OpmlError::Json`] - The content does not parse
/// - [`OpmlError::UnknownExtension`] - The extension is not `.opml`,
///   `.xml`, or `.json`
pub fn load(path: impl AsRef<Path>) -> Result<Opml, OpmlError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_lowercase();

    let content = fs::read_to_string(path)?;
    match extension.as_str() {
        "opml" | "xml" => parse_xml(&content),
        "json" => {
            #[derive(Deserialize)]
            struct Wrapper {
                opml: Opml,
            }
            let wrapper: Wrapper = serde_json::from_str(&content)?;
            Ok(wrapper.opml)
        }
        other => Err(OpmlError::UnknownExtension(other.to_string())),
    }
}

fn parse_xml(content: &str) -> Result<Opml, OpmlError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut opml = Opml::default();
    let mut buf = Vec::new();
    let mut in_title = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"opml" => {
                let decoder = reader.decoder();
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"version" {
                        opml.version = attr.decode_and_unescape_value(decoder)?.to_string();
                    }
                }
            }
            Ok(Event::Start(e)) if e.name().as_ref() == b"title" => in_title = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"title" => in_title = false,
            Ok(Event::Text(t)) if in_title => {
                opml.head.title = t.unescape()?.to_string();
            }
            Ok(Event::Empty(e)) | Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                let decoder = reader.decoder();
                let mut outline = Outline::default();

                for attr in e.attributes().flatten() {
                    let value = attr.decode_and_unescape_value(decoder)?.to_string();
                    match attr.key.as_ref() {
                        b"text" => outline.text = value,
                        b"title" => outline.title = value,
                        b"type" => outline.outline_type = value,
                        b"xmlUrl" => outline.xml_url = value,
                        b"htmlUrl" => outline.html_url = value,
                        _ => {}
                    }
                }
                opml.body.outlines.push(outline);
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(OpmlError::Xml(err)),
            _ => {}
        }
        buf.clear();
    }

    Ok(opml)
}

impl Opml {
    /// Collects the feed URLs declared by the outline.
    ///
    /// # Arguments
    ///
    /// * `types` - Outline `type` values to include (case-insensitive);
    ///   empty means every outline
    ///
    /// # Returns
    ///
    /// Each matching outline's `xmlUrl`, falling back to `htmlUrl`,
    /// skipping outlines with neither, in document order.
    pub fn urls(&self, types: &[&str]) -> Vec<String> {
        let mut urls = Vec::new();
        collect_urls(&self.body.outlines, types, &mut urls);
        urls
    }
}

fn collect_urls(outlines: &[Outline], types: &[&str], urls: &mut Vec<String>) {
    for outline in outlines {
        let type_matches = types.is_empty()
            || types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&outline.outline_type));

        if type_matches {
            if !outline.xml_url.is_empty() {
                urls.push(outline.xml_url.clone());
            } else if !outline.html_url.is_empty() {
                urls.push(outline.html_url.clone());
            }
        }

        collect_urls(&outline.outlines, types, urls);
    }
}
