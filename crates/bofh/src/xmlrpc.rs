//! XML-RPC wire codec: `methodCall` encoding and `methodResponse` decoding.

use std::collections::BTreeMap;

use base64::Engine;
use chrono::NaiveDateTime;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::types::{BofhError, BofhResult};
use crate::value::Value;

/// `dateTime.iso8601` layout produced by Python's xmlrpclib.
const DATETIME_FORMAT: &str = "%Y%m%dT%H:%M:%S";

/// Dashed variant some servers emit.
const DATETIME_FORMAT_DASHED: &str = "%Y-%m-%dT%H:%M:%S";

/// Encode a method call document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version='1.0'?>\n<methodCall>\n<methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName>\n<params>\n");
    for param in params {
        out.push_str("<param>\n");
        encode_value(&mut out, param);
        out.push_str("</param>\n");
    }
    out.push_str("</params>\n</methodCall>\n");
    out
}

/// Encode a successful method response document.
pub fn encode_response(value: &Value) -> String {
    let mut out = String::from("<?xml version='1.0'?>\n<methodResponse>\n<params>\n<param>\n");
    encode_value(&mut out, value);
    out.push_str("</param>\n</params>\n</methodResponse>\n");
    out
}

/// Encode a fault response document.
pub fn encode_fault(code: i32, message: &str) -> String {
    let mut fault = BTreeMap::new();
    fault.insert("faultCode".to_string(), Value::Int(code));
    fault.insert("faultString".to_string(), Value::String(message.to_string()));

    let mut out = String::from("<?xml version='1.0'?>\n<methodResponse>\n<fault>\n");
    encode_value(&mut out, &Value::Struct(fault));
    out.push_str("</fault>\n</methodResponse>\n");
    out
}

fn encode_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(i) => out.push_str(&format!("<int>{i}</int>")),
        Value::Boolean(b) => out.push_str(&format!("<boolean>{}</boolean>", u8::from(*b))),
        Value::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        Value::Double(d) => out.push_str(&format!("<double>{d}</double>")),
        Value::DateTime(dt) => out.push_str(&format!(
            "<dateTime.iso8601>{}</dateTime.iso8601>",
            dt.format(DATETIME_FORMAT)
        )),
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&base64::engine::general_purpose::STANDARD.encode(bytes));
            out.push_str("</base64>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>\n");
            for item in items {
                encode_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>\n");
            for (name, member) in members {
                out.push_str("<member>\n<name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>\n");
                encode_value(out, member);
                out.push_str("</member>\n");
            }
            out.push_str("</struct>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>\n");
}

/// Decode a method response document.
///
/// A `<fault>` response becomes [`BofhError::RemoteFault`]; anything that is
/// not a well-formed response is a [`BofhError::TransportFault`].
pub fn decode_response(xml: &str) -> BofhResult<Value> {
    let mut decoder = Decoder::new(xml);
    decoder.expect_start("methodResponse")?;

    match decoder.structural()? {
        Event::Start(e) if is(&e, "params") => {
            decoder.expect_start("param")?;
            decoder.expect_start("value")?;
            let value = decoder.value()?;
            decoder.expect_end("param")?;
            decoder.expect_end("params")?;
            decoder.expect_end("methodResponse")?;
            Ok(value)
        }
        Event::Start(e) if is(&e, "fault") => {
            decoder.expect_start("value")?;
            let value = decoder.value()?;
            decoder.expect_end("fault")?;
            Err(fault_from(&value))
        }
        other => Err(unexpected("<params> or <fault>", &other)),
    }
}

fn fault_from(value: &Value) -> BofhError {
    let code = value
        .get("faultCode")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or(0);
    let message = value
        .get("faultString")
        .map(ToString::to_string)
        .unwrap_or_default();
    BofhError::RemoteFault { code, message }
}

fn malformed(msg: impl std::fmt::Display) -> BofhError {
    BofhError::TransportFault(format!("Malformed XML-RPC response: {msg}"))
}

fn is(e: &BytesStart<'_>, tag: &str) -> bool {
    e.local_name().as_ref() == tag.as_bytes()
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn describe(event: &Event<'_>) -> String {
    match event {
        Event::Start(e) => format!("<{}>", tag_name(e)),
        Event::Empty(e) => format!("<{}/>", tag_name(e)),
        Event::End(e) => format!("</{}>", String::from_utf8_lossy(e.local_name().as_ref())),
        Event::Text(_) | Event::CData(_) => "text".to_string(),
        Event::Eof => "end of document".to_string(),
        _ => "markup".to_string(),
    }
}

fn unexpected(wanted: &str, got: &Event<'_>) -> BofhError {
    malformed(format!("expected {wanted}, found {}", describe(got)))
}

struct Decoder<'a> {
    reader: Reader<&'a [u8]>,
}

impl<'a> Decoder<'a> {
    fn new(xml: &'a str) -> Self {
        Self {
            reader: Reader::from_str(xml),
        }
    }

    /// Next event, skipping declarations, comments and processing instructions.
    fn raw(&mut self) -> BofhResult<Event<'a>> {
        loop {
            match self.reader.read_event().map_err(malformed)? {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                event => return Ok(event),
            }
        }
    }

    /// Next event that is not whitespace between elements.
    fn structural(&mut self) -> BofhResult<Event<'a>> {
        loop {
            let event = self.raw()?;
            if let Event::Text(text) = &event {
                if text.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
            }
            return Ok(event);
        }
    }

    fn expect_start(&mut self, tag: &str) -> BofhResult<()> {
        match self.structural()? {
            Event::Start(e) if is(&e, tag) => Ok(()),
            other => Err(unexpected(&format!("<{tag}>"), &other)),
        }
    }

    fn expect_end(&mut self, tag: &str) -> BofhResult<()> {
        match self.structural()? {
            Event::End(e) if e.local_name().as_ref() == tag.as_bytes() => Ok(()),
            other => Err(unexpected(&format!("</{tag}>"), &other)),
        }
    }

    /// Character data up to the closing `tag`.
    fn text_until(&mut self, tag: &str) -> BofhResult<String> {
        let mut text = String::new();
        loop {
            match self.raw()? {
                Event::Text(t) => text.push_str(&t.unescape().map_err(malformed)?),
                Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
                Event::End(e) if e.local_name().as_ref() == tag.as_bytes() => return Ok(text),
                other => return Err(unexpected(&format!("text in <{tag}>"), &other)),
            }
        }
    }

    /// Parse the body of a `<value>` whose start tag was already consumed.
    fn value(&mut self) -> BofhResult<Value> {
        let mut text = String::new();
        loop {
            match self.raw()? {
                Event::Text(t) => text.push_str(&t.unescape().map_err(malformed)?),
                Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
                // Untyped values are strings.
                Event::End(e) if e.local_name().as_ref() == b"value" => {
                    return Ok(Value::String(text))
                }
                Event::Start(e) => {
                    let value = self.typed(&tag_name(&e))?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                Event::Empty(e) => {
                    let value = empty_typed(&tag_name(&e))?;
                    self.expect_end("value")?;
                    return Ok(value);
                }
                other => return Err(unexpected("value content", &other)),
            }
        }
    }

    fn typed(&mut self, tag: &str) -> BofhResult<Value> {
        match tag {
            "string" => Ok(Value::String(self.text_until(tag)?)),
            "int" | "i4" | "i8" => {
                let raw = self.text_until(tag)?;
                raw.trim()
                    .parse::<i32>()
                    .map(Value::Int)
                    .map_err(|e| malformed(format!("bad integer '{raw}': {e}")))
            }
            "boolean" => match self.text_until(tag)?.trim() {
                "1" => Ok(Value::Boolean(true)),
                "0" => Ok(Value::Boolean(false)),
                other => Err(malformed(format!("bad boolean '{other}'"))),
            },
            "double" => {
                let raw = self.text_until(tag)?;
                raw.trim()
                    .parse::<f64>()
                    .map(Value::Double)
                    .map_err(|e| malformed(format!("bad double '{raw}': {e}")))
            }
            "dateTime.iso8601" => parse_datetime(&self.text_until(tag)?).map(Value::DateTime),
            "base64" => {
                let raw: String = self
                    .text_until(tag)?
                    .chars()
                    .filter(|c| !c.is_whitespace())
                    .collect();
                base64::engine::general_purpose::STANDARD
                    .decode(raw)
                    .map(Value::Base64)
                    .map_err(|e| malformed(format!("bad base64: {e}")))
            }
            "nil" => {
                self.expect_end("nil")?;
                Ok(Value::Nil)
            }
            "array" => self.array(),
            "struct" => self.structure(),
            other => Err(malformed(format!("unknown value type <{other}>"))),
        }
    }

    fn array(&mut self) -> BofhResult<Value> {
        let mut items = Vec::new();
        match self.structural()? {
            Event::Empty(e) if is(&e, "data") => {}
            Event::Start(e) if is(&e, "data") => loop {
                match self.structural()? {
                    Event::Start(e) if is(&e, "value") => items.push(self.value()?),
                    Event::Empty(e) if is(&e, "value") => items.push(Value::String(String::new())),
                    Event::End(e) if e.local_name().as_ref() == b"data" => break,
                    other => return Err(unexpected("<value> in <data>", &other)),
                }
            },
            other => return Err(unexpected("<data>", &other)),
        }
        self.expect_end("array")?;
        Ok(Value::Array(items))
    }

    fn structure(&mut self) -> BofhResult<Value> {
        let mut members = BTreeMap::new();
        loop {
            match self.structural()? {
                Event::Start(e) if is(&e, "member") => {
                    self.expect_start("name")?;
                    let name = self.text_until("name")?;
                    let value = match self.structural()? {
                        Event::Start(e) if is(&e, "value") => self.value()?,
                        Event::Empty(e) if is(&e, "value") => Value::String(String::new()),
                        other => return Err(unexpected("<value> in <member>", &other)),
                    };
                    self.expect_end("member")?;
                    members.insert(name, value);
                }
                Event::End(e) if e.local_name().as_ref() == b"struct" => break,
                other => return Err(unexpected("<member>", &other)),
            }
        }
        Ok(Value::Struct(members))
    }
}

fn empty_typed(tag: &str) -> BofhResult<Value> {
    match tag {
        "nil" => Ok(Value::Nil),
        "string" => Ok(Value::String(String::new())),
        "struct" => Ok(Value::Struct(BTreeMap::new())),
        "array" => Ok(Value::Array(Vec::new())),
        other => Err(malformed(format!("empty <{other}/> is not a value"))),
    }
}

fn parse_datetime(raw: &str) -> BofhResult<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT_DASHED))
        .map_err(|e| malformed(format!("bad dateTime.iso8601 '{raw}': {e}")))
}
