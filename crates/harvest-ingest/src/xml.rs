//! XML-to-JSON conversion for record units.
//!
//! Converts one XML fragment into a `serde_json::Value` tree: child
//! elements become object keys, attributes become `@`-prefixed keys, and
//! repeated siblings collapse into arrays. Elements named in
//! `force_array` always parse as arrays so downstream consumers see a
//! stable shape whether a record carries one occurrence or many.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};
use tracing::warn;

/// Conversion options.
#[derive(Debug, Clone, Default)]
pub struct XmlOptions {
    /// Element names that always parse as arrays, even for a single
    /// occurrence.
    pub force_array: Vec<String>,

    /// When true, a malformed tail stops the conversion with a warning and
    /// whatever parsed cleanly is returned instead of an error.
    pub lenient: bool,
}

impl XmlOptions {
    pub fn with_force_array<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force_array = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }
}

#[derive(Debug, thiserror::Error)]
#[error("xml parse error: {0}")]
pub struct XmlParseError(String);

struct Frame {
    name: String,
    attrs: Map<String, Value>,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn new(name: String, attrs: Map<String, Value>) -> Self {
        Self {
            name,
            attrs,
            children: Map::new(),
            text: String::new(),
        }
    }

    /// Collapse the finished frame into a value: text-only elements become
    /// strings, empty elements null, everything else an object with
    /// attributes, children and any interleaved text under `#text`.
    fn into_value(self) -> Value {
        let text = self.text.trim().to_string();
        if self.attrs.is_empty() && self.children.is_empty() {
            return if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
        }

        let mut map = self.attrs;
        map.extend(self.children);
        if !text.is_empty() {
            map.insert("#text".to_string(), Value::String(text));
        }
        Value::Object(map)
    }
}

/// Convert one XML fragment into a JSON value. The root element's own name
/// is not part of the result; its content is.
pub fn to_value(text: &str, options: &XmlOptions) -> Result<Value, XmlParseError> {
    let mut reader = Reader::from_str(text);
    let mut root = Frame::new(String::new(), Map::new());
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let frame = open_frame(&e, options)?;
                stack.push(frame);
            },
            Ok(Event::Empty(e)) => {
                let frame = open_frame(&e, options)?;
                let name = frame.name.clone();
                let value = frame.into_value();
                attach(stack.last_mut().unwrap_or(&mut root), &name, value, options);
            },
            Ok(Event::Text(t)) => {
                let frame = stack.last_mut().unwrap_or(&mut root);
                match t.unescape() {
                    Ok(s) => frame.text.push_str(&s),
                    Err(e) if options.lenient => {
                        warn!("Skipping undecodable text node: {}", e);
                    },
                    Err(e) => return Err(XmlParseError(e.to_string())),
                }
            },
            Ok(Event::CData(t)) => {
                let frame = stack.last_mut().unwrap_or(&mut root);
                frame.text.push_str(&String::from_utf8_lossy(t.as_ref()));
            },
            Ok(Event::End(_)) => {
                let Some(frame) = stack.pop() else {
                    if options.lenient {
                        warn!("Unbalanced closing tag, stopping parse");
                        break;
                    }
                    return Err(XmlParseError("unbalanced closing tag".to_string()));
                };
                let name = frame.name.clone();
                let value = frame.into_value();
                attach(stack.last_mut().unwrap_or(&mut root), &name, value, options);
            },
            Ok(Event::Eof) => {
                if !stack.is_empty() && !options.lenient {
                    return Err(XmlParseError(format!(
                        "unclosed element <{}>",
                        stack[stack.len() - 1].name
                    )));
                }
                break;
            },
            Ok(_) => {},
            Err(e) if options.lenient => {
                warn!("Malformed xml tail, stopping parse: {}", e);
                break;
            },
            Err(e) => return Err(XmlParseError(e.to_string())),
        }
    }

    // Lenient parses can stop mid-document; fold any unclosed elements into
    // their parents so the clean prefix survives.
    while let Some(frame) = stack.pop() {
        let name = frame.name.clone();
        let value = frame.into_value();
        attach(stack.last_mut().unwrap_or(&mut root), &name, value, options);
    }

    // A root with one named child unwraps to that child's content.
    if root.attrs.is_empty() && root.children.len() == 1 && root.text.trim().is_empty() {
        let (_, value) = root
            .children
            .into_iter()
            .next()
            .unwrap_or((String::new(), Value::Null));
        return Ok(value);
    }
    Ok(root.into_value())
}

fn open_frame(e: &BytesStart<'_>, options: &XmlOptions) -> Result<Frame, XmlParseError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
    let mut attrs = Map::new();

    for attr in e.attributes() {
        match attr {
            Ok(attr) => {
                let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                let value = attr
                    .unescape_value()
                    .map_err(|e| XmlParseError(e.to_string()))?;
                attrs.insert(key, Value::String(value.to_string()));
            },
            Err(e) if options.lenient => {
                warn!("Skipping malformed attribute on <{}>: {}", name, e);
            },
            Err(e) => return Err(XmlParseError(e.to_string())),
        }
    }

    Ok(Frame::new(name, attrs))
}

/// Insert a finished child into its parent. A repeated name collapses into
/// an array; forced names are arrays from the first occurrence.
fn attach(parent: &mut Frame, name: &str, value: Value, options: &XmlOptions) {
    match parent.children.get_mut(name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        },
        None => {
            let forced = options.force_array.iter().any(|n| n == name);
            let value = if forced { Value::Array(vec![value]) } else { value };
            parent.children.insert(name.to_string(), value);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_nested_element() {
        let value = to_value(
            "<Article><Title>On Harvesting</Title><Year>2026</Year></Article>",
            &XmlOptions::default(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({ "Title": "On Harvesting", "Year": "2026" })
        );
    }

    #[test]
    fn test_repeated_siblings_become_array() {
        let value = to_value(
            "<Authors><Author>A</Author><Author>B</Author></Authors>",
            &XmlOptions::default(),
        )
        .unwrap();
        assert_eq!(value, json!({ "Author": ["A", "B"] }));
    }

    #[test]
    fn test_force_array_single_occurrence() {
        let options = XmlOptions::default().with_force_array(["Author"]);
        let value = to_value("<Authors><Author>A</Author></Authors>", &options).unwrap();
        assert_eq!(value, json!({ "Author": ["A"] }));
    }

    #[test]
    fn test_attributes_get_at_prefix() {
        let value = to_value(
            r#"<Id Version="2">12345</Id>"#,
            &XmlOptions::default(),
        )
        .unwrap();
        assert_eq!(value, json!({ "@Version": "2", "#text": "12345" }));
    }

    #[test]
    fn test_empty_element_is_null() {
        let value = to_value("<Outer><Flag/></Outer>", &XmlOptions::default()).unwrap();
        assert_eq!(value, json!({ "Flag": null }));
    }

    #[test]
    fn test_malformed_input_errors_when_strict() {
        let result = to_value("<A><B></A>", &XmlOptions::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_lenient_returns_partial() {
        let options = XmlOptions::default().lenient(true);
        let value = to_value("<A><B>x</B><C", &options).unwrap();
        assert_eq!(value["B"], json!("x"));
    }

    #[test]
    fn test_entity_unescaping() {
        let value = to_value(
            "<T>fish &amp; chips</T>",
            &XmlOptions::default(),
        )
        .unwrap();
        assert_eq!(value, json!("fish & chips"));
    }
}
