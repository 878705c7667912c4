//! The `<parameters>` fragment stored with each task log line.
//!
//! ```xml
//! <parameters><parameter value="example.com"/><parameter value="42"/></parameters>
//! ```
//!
//! Only direct `parameter` children of a `parameters` root are read, in
//! document order.

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::warn;

use panel_core::ServiceError;

const ROOT: &str = "parameters";
const ITEM: &str = "parameter";
const VALUE_ATTR: &str = "value";

/// Build the fragment for a log line's text parameters.
pub fn build_parameters_xml(parameters: &[String]) -> Result<String, ServiceError> {
    let mut writer = Writer::new(Vec::new());

    if parameters.is_empty() {
        writer
            .write_event(Event::Empty(BytesStart::new(ROOT)))
            .map_err(write_err)?;
    } else {
        writer
            .write_event(Event::Start(BytesStart::new(ROOT)))
            .map_err(write_err)?;
        for value in parameters {
            let mut item = BytesStart::new(ITEM);
            item.push_attribute((VALUE_ATTR, value.as_str()));
            writer.write_event(Event::Empty(item)).map_err(write_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(ROOT)))
            .map_err(write_err)?;
    }

    String::from_utf8(writer.into_inner()).map_err(write_err)
}

/// Parse a stored fragment back into its text parameters.
///
/// Blank input yields no parameters. A document whose root is not
/// `parameters` yields no parameters either, with a warning.
pub fn parse_parameters_xml(xml: &str) -> Result<Vec<String>, ServiceError> {
    if xml.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = Reader::from_str(xml);
    let mut values = Vec::new();
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut root: Option<Vec<u8>> = None;

    loop {
        match reader.read_event().map_err(decode_err)? {
            Event::Start(e) => {
                if is_item(&path, &e) {
                    values.push(item_value(&e)?);
                }
                if path.is_empty() && root.is_none() {
                    root = Some(e.name().as_ref().to_vec());
                }
                path.push(e.name().as_ref().to_vec());
            }
            Event::Empty(e) => {
                if path.is_empty() && root.is_none() {
                    root = Some(e.name().as_ref().to_vec());
                }
                if is_item(&path, &e) {
                    values.push(item_value(&e)?);
                }
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !path.is_empty() {
        return Err(ServiceError::Decode(format!(
            "parameters fragment ends inside <{}>",
            String::from_utf8_lossy(&path[path.len() - 1])
        )));
    }

    if let Some(root) = root.filter(|r| r != ROOT.as_bytes()) {
        warn!(
            "log parameters fragment has root <{}>, expected <{ROOT}>; reading no parameters",
            String::from_utf8_lossy(&root)
        );
    }

    Ok(values)
}

fn is_item(path: &[Vec<u8>], e: &BytesStart<'_>) -> bool {
    path.len() == 1 && path[0] == ROOT.as_bytes() && e.name().as_ref() == ITEM.as_bytes()
}

/// Reads every attribute so that a repeated `value` is rejected.
fn item_value(e: &BytesStart<'_>) -> Result<String, ServiceError> {
    let mut value = None;
    for attr in e.attributes() {
        let attr = attr.map_err(decode_err)?;
        if attr.key.as_ref() == VALUE_ATTR.as_bytes() {
            value = Some(attr.unescape_value().map_err(decode_err)?.into_owned());
        }
    }
    value.ok_or_else(|| ServiceError::Decode("<parameter> without value attribute".into()))
}

fn write_err(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Internal(format!("build parameters xml: {e}"))
}

fn decode_err(e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Decode(format!("parameters xml: {e}"))
}
