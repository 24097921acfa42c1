//! Rendering command results with server-supplied format suggestions.
//!
//! A suggestion has an optional header and a list of rows. Each row is a
//! `%`-style template plus the field names to substitute, optionally with a
//! sub-header. A field may carry a `:date:<pattern>` suffix, e.g.
//! `create_date:date:yyyy-MM-dd`.

use chrono::NaiveDateTime;

use crate::types::{BofhError, BofhResult};
use crate::value::Value;

/// Shown for null fields.
pub const NOT_SET: &str = "<not set>";

/// Date pattern tokens and their strftime equivalents.
const DATE_TOKENS: &[(&str, &str)] = &[
    ("yyyy", "%Y"),
    ("MM", "%m"),
    ("dd", "%d"),
    ("HH", "%H"),
    ("mm", "%M"),
    ("ss", "%S"),
];

/// A field reference inside a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub name: String,
    pub date_pattern: Option<String>,
}

impl FieldRef {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((name, rest)) => Self {
                name: name.to_string(),
                date_pattern: rest.strip_prefix("date:").map(str::to_string),
            },
            None => Self {
                name: raw.to_string(),
                date_pattern: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatRow {
    pub template: String,
    pub fields: Vec<FieldRef>,
    pub sub_header: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuggestionBody {
    /// Printed verbatim.
    Text(String),
    Rows(Vec<FormatRow>),
    Empty,
}

/// Parsed `get_format_suggestion` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSuggestion {
    pub header: Option<String>,
    pub body: SuggestionBody,
}

impl FormatSuggestion {
    /// Parse a washed suggestion. Returns `None` when the server has none.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_struct()?;
        let header = map.get("hdr").and_then(Value::as_str).map(str::to_string);

        let body = match map.get("str_vars") {
            Some(Value::String(text)) => SuggestionBody::Text(text.clone()),
            Some(Value::Array(rows)) => SuggestionBody::Rows(
                rows.iter()
                    .filter_map(|row| {
                        let parsed = parse_row(row);
                        if parsed.is_none() {
                            tracing::warn!("Ignoring malformed format row {}", row.repr());
                        }
                        parsed
                    })
                    .collect(),
            ),
            _ => SuggestionBody::Empty,
        };

        if header.is_none() && body == SuggestionBody::Empty {
            return None;
        }
        Some(Self { header, body })
    }

    /// Render a result (one object or a list of objects).
    pub fn render(&self, result: &Value) -> BofhResult<String> {
        if let Value::String(text) = result {
            return Ok(text.clone());
        }

        let mut lines = Vec::new();
        if let Some(header) = &self.header {
            lines.push(header.clone());
        }

        match &self.body {
            SuggestionBody::Text(text) => lines.push(text.clone()),
            SuggestionBody::Rows(rows) => {
                let objects: Vec<&Value> = match result {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                };
                for row in rows {
                    let mut rendered = Vec::new();
                    for object in &objects {
                        if let Some(args) = row_arguments(row, object) {
                            rendered.push(percent_format(&row.template, &args)?);
                        }
                    }
                    if !rendered.is_empty() {
                        if let Some(sub_header) = &row.sub_header {
                            lines.push(sub_header.clone());
                        }
                        lines.extend(rendered);
                    }
                }
            }
            SuggestionBody::Empty => {}
        }

        Ok(lines.join("\n"))
    }
}

fn parse_row(row: &Value) -> Option<FormatRow> {
    let parts = row.as_array()?;
    let template = parts.first()?.as_str()?.to_string();
    let fields = match parts.get(1) {
        Some(Value::Array(names)) => names
            .iter()
            .map(|n| n.as_str().map(FieldRef::parse))
            .collect::<Option<Vec<_>>>()?,
        Some(Value::Nil) | None => Vec::new(),
        Some(_) => return None,
    };
    let sub_header = parts.get(2).and_then(Value::as_str).map(str::to_string);
    Some(FormatRow {
        template,
        fields,
        sub_header,
    })
}

/// Values for one row, or `None` if the object lacks any field.
fn row_arguments(row: &FormatRow, object: &Value) -> Option<Vec<Value>> {
    let map = object.as_struct()?;
    row.fields
        .iter()
        .map(|field| {
            let value = map.get(&field.name)?;
            Some(match (value, &field.date_pattern) {
                (Value::Nil, _) => Value::Nil,
                (value, Some(pattern)) => Value::String(format_date(value, pattern)),
                (value, None) => value.clone(),
            })
        })
        .collect()
}

fn format_date(value: &Value, pattern: &str) -> String {
    let format = translate_date_pattern(pattern);
    match value {
        Value::DateTime(dt) => dt.format(&format).to_string(),
        Value::String(s) => match parse_date_string(s) {
            Some(dt) => dt.format(&format).to_string(),
            None => s.clone(),
        },
        other => other.to_string(),
    }
}

fn parse_date_string(s: &str) -> Option<NaiveDateTime> {
    ["%Y%m%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s.trim(), f).ok())
}

/// Translate a `yyyy-MM-dd HH:mm` style pattern into a strftime format.
pub fn translate_date_pattern(pattern: &str) -> String {
    let mut out = String::new();
    let mut rest = pattern;
    'outer: while let Some(c) = rest.chars().next() {
        for (token, strftime) in DATE_TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                out.push_str(strftime);
                rest = after;
                continue 'outer;
            }
        }
        if c == '%' {
            out.push_str("%%");
        } else {
            out.push(c);
        }
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Render a result without a suggestion.
pub fn render_plain(result: &Value) -> String {
    match result {
        Value::Nil => String::new(),
        Value::Array(items) => items
            .iter()
            .map(render_plain)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Struct(map) => {
            let width = map.keys().map(|k| k.chars().count() + 1).max().unwrap_or(0);
            map.iter()
                .map(|(k, v)| {
                    let label = format!("{k}:");
                    let shown = if v.is_nil() { NOT_SET.to_string() } else { v.to_string() };
                    format!("{label:<width$} {shown}")
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        other => other.to_string(),
    }
}

/// Render with the suggestion if there is one.
pub fn render(suggestion: Option<&FormatSuggestion>, result: &Value) -> BofhResult<String> {
    match suggestion {
        Some(suggestion) => suggestion.render(result),
        None => Ok(render_plain(result)),
    }
}

#[derive(Debug, Default)]
struct FormatSpec {
    left: bool,
    zero: bool,
    plus: bool,
    space: bool,
    alternate: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

/// Python-style `%` formatting with positional arguments.
pub fn percent_format(template: &str, args: &[Value]) -> BofhResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_arg = args.iter();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }

        let mut spec = FormatSpec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.left = true,
                '0' => spec.zero = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => spec.alternate = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = read_number(&mut chars);
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(read_number(&mut chars).unwrap_or(0));
        }
        while matches!(chars.peek(), Some('l' | 'h' | 'L')) {
            chars.next();
        }

        let conversion = chars
            .next()
            .ok_or_else(|| BofhError::Format(format!("incomplete format in '{template}'")))?;
        if conversion == '%' {
            out.push('%');
            continue;
        }

        let arg = next_arg.next().ok_or_else(|| {
            BofhError::Format(format!("not enough arguments for format '{template}'"))
        })?;
        out.push_str(&convert(conversion, arg, &spec)?);
    }

    if next_arg.next().is_some() {
        return Err(BofhError::Format(format!(
            "not all arguments converted in '{template}'"
        )));
    }
    Ok(out)
}

fn read_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut digits = String::new();
    while let Some(&d) = chars.peek() {
        if !d.is_ascii_digit() {
            break;
        }
        digits.push(d);
        chars.next();
    }
    digits.parse().ok()
}

fn convert(conversion: char, arg: &Value, spec: &FormatSpec) -> BofhResult<String> {
    let needs_number =
        || BofhError::Format(format!("%{conversion} format: a number is required, not {}", arg.repr()));

    // Null fields show as the placeholder whatever the conversion.
    if matches!(arg, Value::Nil) {
        return Ok(pad(NOT_SET.to_string(), spec, false));
    }

    match conversion {
        's' | 'r' => {
            let mut text = if conversion == 's' { arg.to_string() } else { arg.repr() };
            if let Some(precision) = spec.precision {
                text = text.chars().take(precision).collect();
            }
            Ok(pad(text, spec, false))
        }
        'd' | 'i' | 'u' => {
            let n = arg.as_i64().ok_or_else(needs_number)?;
            Ok(pad(signed(n < 0, n.unsigned_abs().to_string(), spec), spec, true))
        }
        'x' | 'X' | 'o' => {
            let n = arg.as_i64().ok_or_else(needs_number)?;
            let magnitude = n.unsigned_abs();
            let digits = match conversion {
                'x' => format!("{magnitude:x}"),
                'X' => format!("{magnitude:X}"),
                _ => format!("{magnitude:o}"),
            };
            let prefix = match (spec.alternate, conversion) {
                (true, 'x') => "0x",
                (true, 'X') => "0X",
                (true, _) => "0o",
                (false, _) => "",
            };
            Ok(pad(signed(n < 0, format!("{prefix}{digits}"), spec), spec, true))
        }
        'f' | 'F' => {
            let f = arg.as_f64().ok_or_else(needs_number)?;
            let precision = spec.precision.unwrap_or(6);
            let digits = format!("{:.*}", precision, f.abs());
            Ok(pad(signed(f.is_sign_negative() && f != 0.0, digits, spec), spec, true))
        }
        'e' | 'E' => {
            let f = arg.as_f64().ok_or_else(needs_number)?;
            let precision = spec.precision.unwrap_or(6);
            let raw = format!("{:.*e}", precision, f.abs());
            // Rust writes `1.5e2`, printf writes `1.5e+02`.
            let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            let mut digits = format!("{mantissa}e{sign}{:02}", exponent.abs());
            if conversion == 'E' {
                digits = digits.to_uppercase();
            }
            Ok(pad(signed(f.is_sign_negative() && f != 0.0, digits, spec), spec, true))
        }
        'g' | 'G' => {
            let f = arg.as_f64().ok_or_else(needs_number)?;
            let mut digits = general(f.abs(), spec.precision.unwrap_or(6), spec.alternate);
            if conversion == 'G' {
                digits = digits.to_uppercase();
            }
            Ok(pad(signed(f.is_sign_negative() && f != 0.0, digits, spec), spec, true))
        }
        'c' => {
            let text = match arg {
                Value::String(s) if s.chars().count() == 1 => s.clone(),
                other => other
                    .as_i64()
                    .and_then(|n| u32::try_from(n).ok())
                    .and_then(char::from_u32)
                    .map(String::from)
                    .ok_or_else(|| BofhError::Format("%c requires an int or char".to_string()))?,
            };
            Ok(pad(text, spec, false))
        }
        other => Err(BofhError::Format(format!(
            "unsupported format character '{other}'"
        ))),
    }
}

/// printf `%g` for a non-negative value: `%e` style when the exponent is
/// below -4 or at least the precision, `%f` style otherwise. Trailing zeros
/// go unless `#` is given.
fn general(f: f64, precision: usize, alternate: bool) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return "inf".to_string();
    }

    let precision = precision.max(1);
    let scientific = format!("{:.*e}", precision - 1, f);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let significant = i32::try_from(precision).unwrap_or(i32::MAX);

    let trim = |digits: &str| {
        if alternate || !digits.contains('.') {
            digits.to_string()
        } else {
            digits.trim_end_matches('0').trim_end_matches('.').to_string()
        }
    };

    if exponent < -4 || exponent >= significant {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim(mantissa), exponent.abs())
    } else {
        let decimals = usize::try_from(significant - 1 - exponent).unwrap_or(0);
        trim(&format!("{f:.decimals$}"))
    }
}

fn signed(negative: bool, digits: String, spec: &FormatSpec) -> String {
    if negative {
        format!("-{digits}")
    } else if spec.plus {
        format!("+{digits}")
    } else if spec.space {
        format!(" {digits}")
    } else {
        digits
    }
}

fn pad(text: String, spec: &FormatSpec, numeric: bool) -> String {
    let len = text.chars().count();
    let Some(width) = spec.width.filter(|w| *w > len) else {
        return text;
    };
    let fill = width - len;

    if spec.left {
        format!("{text}{}", " ".repeat(fill))
    } else if spec.zero && numeric {
        // Zeros go after the sign.
        let sign_len = usize::from(text.starts_with(['-', '+', ' ']));
        let (sign, digits) = text.split_at(sign_len);
        format!("{sign}{}{digits}", "0".repeat(fill))
    } else {
        format!("{}{text}", " ".repeat(fill))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn object(pairs: &[(&str, Value)]) -> Value {
        Value::Struct(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn row(template: &str, fields: &[&str], sub_header: Option<&str>) -> Value {
        let mut parts = vec![Value::from(template), Value::from(fields.to_vec())];
        if let Some(sub) = sub_header {
            parts.push(Value::from(sub));
        }
        Value::Array(parts)
    }

    #[test]
    fn test_date_pattern_translation() {
        assert_eq!(translate_date_pattern("yyyy-MM-dd"), "%Y-%m-%d");
        assert_eq!(translate_date_pattern("dd.MM.yyyy HH:mm:ss"), "%d.%m.%Y %H:%M:%S");
        assert_eq!(translate_date_pattern("100% yyyy"), "100%% %Y");

        let ts = NaiveDate::from_ymd_opt(2014, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap();
        assert_eq!(format_date(&Value::DateTime(ts), "yyyy-MM-dd"), "2014-03-07");
        assert_eq!(format_date(&Value::DateTime(ts), "HH:mm"), "09:05");
    }

    #[test]
    fn test_percent_format_basics() {
        let args = [Value::from("bob"), Value::Int(42), Value::Double(3.14159)];
        assert_eq!(
            percent_format("%-6s|%5d|%05.1f", &args).unwrap(),
            "bob   |   42|003.1"
        );
        assert_eq!(percent_format("100%%", &[]).unwrap(), "100%");
        assert_eq!(percent_format("%+d %x %#X", &[Value::Int(5), Value::Int(255), Value::Int(255)]).unwrap(), "+5 ff 0XFF");
        assert_eq!(percent_format("%05d", &[Value::Int(-42)]).unwrap(), "-0042");
        assert_eq!(percent_format("%.2s", &[Value::from("abcdef")]).unwrap(), "ab");
        assert_eq!(percent_format("%r", &[Value::from("x")]).unwrap(), "'x'");
        assert_eq!(percent_format("%e", &[Value::Double(150.0)]).unwrap(), "1.500000e+02");
    }

    #[test]
    fn test_percent_format_general() {
        let g = |template: &str, f: f64| percent_format(template, &[Value::Double(f)]).unwrap();
        assert_eq!(g("%g", 0.0001234), "0.0001234");
        assert_eq!(g("%g", 1234567.0), "1.23457e+06");
        assert_eq!(g("%.3g", 3.14159), "3.14");
        assert_eq!(g("%g", 100000.0), "100000");
        assert_eq!(g("%g", 1e-5), "1e-05");
        assert_eq!(g("%g", 0.0), "0");
        assert_eq!(g("%g", -2.5), "-2.5");
        assert_eq!(g("%G", 1.5e-10), "1.5E-10");
        assert_eq!(g("%#g", 2.0), "2.00000");
        assert_eq!(g("%10.2g", 123.0), "   1.2e+02");
    }

    #[test]
    fn test_percent_format_errors() {
        assert!(matches!(percent_format("%s %s", &[Value::from("a")]), Err(BofhError::Format(_))));
        assert!(matches!(percent_format("%s", &[Value::from("a"), Value::from("b")]), Err(BofhError::Format(_))));
        assert!(matches!(percent_format("%d", &[Value::from("abc")]), Err(BofhError::Format(_))));
        assert!(matches!(percent_format("trailing %", &[]), Err(BofhError::Format(_))));
    }

    #[test]
    fn test_render_rows_with_missing_field() {
        let suggestion = FormatSuggestion::from_value(&object(&[
            ("hdr", Value::from("Name       Id")),
            (
                "str_vars",
                Value::Array(vec![
                    row("%-10s %d", &["name", "id"], None),
                    row("Expire: %s", &["expire:date:yyyy-MM-dd"], None),
                ]),
            ),
        ]))
        .unwrap();

        let expire = NaiveDate::from_ymd_opt(2014, 3, 7)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let result = Value::Array(vec![
            object(&[("name", Value::from("alice")), ("id", Value::Int(1))]),
            object(&[
                ("name", Value::from("bob")),
                ("id", Value::Int(2)),
                ("expire", Value::DateTime(expire)),
            ]),
        ]);

        let text = suggestion.render(&result).unwrap();
        assert_eq!(
            text,
            "Name       Id\nalice      1\nbob        2\nExpire: 2014-03-07"
        );
    }

    #[test]
    fn test_sub_header_once_and_only_when_rendered() {
        let suggestion = FormatSuggestion::from_value(&object(&[(
            "str_vars",
            Value::Array(vec![
                row("  %s", &["member"], Some("Members:")),
                row("  %s", &["missing"], Some("Never shown:")),
            ]),
        )]))
        .unwrap();

        let result = Value::Array(vec![
            object(&[("member", Value::from("a"))]),
            object(&[("member", Value::from("b"))]),
        ]);
        assert_eq!(suggestion.render(&result).unwrap(), "Members:\n  a\n  b");
    }

    #[test]
    fn test_null_field_and_text_body() {
        let suggestion = FormatSuggestion::from_value(&object(&[(
            "str_vars",
            Value::Array(vec![row("Owner: %s", &["owner"], None)]),
        )]))
        .unwrap();
        let text = suggestion.render(&object(&[("owner", Value::Nil)])).unwrap();
        assert_eq!(text, "Owner: <not set>");

        let numeric = FormatSuggestion::from_value(&object(&[(
            "str_vars",
            Value::Array(vec![
                row("Name:  %s", &["name"], None),
                row("Quota: %d", &["quota"], None),
                row("Used:  %5.1f%%", &["used"], None),
            ]),
        )]))
        .unwrap();
        let text = numeric
            .render(&object(&[
                ("name", Value::from("bob")),
                ("quota", Value::Nil),
                ("used", Value::Nil),
            ]))
            .unwrap();
        assert_eq!(text, "Name:  bob\nQuota: <not set>\nUsed:  <not set>%");

        let verbatim = FormatSuggestion::from_value(&object(&[("str_vars", Value::from("Done"))])).unwrap();
        assert_eq!(verbatim.render(&object(&[])).unwrap(), "Done");
        assert_eq!(verbatim.render(&Value::from("OK, created")).unwrap(), "OK, created");
    }

    #[test]
    fn test_no_suggestion() {
        assert_eq!(FormatSuggestion::from_value(&Value::Nil), None);
        assert_eq!(FormatSuggestion::from_value(&object(&[])), None);
        let plain = render(None, &object(&[("a", Value::Int(1)), ("long_key", Value::Nil)])).unwrap();
        assert_eq!(plain, "a:        1\nlong_key: <not set>");
        assert_eq!(render_plain(&Value::from(vec!["x", "y"])), "x\ny");
    }

    #[test]
    fn test_field_ref_parse() {
        assert_eq!(
            FieldRef::parse("created:date:yyyy"),
            FieldRef { name: "created".into(), date_pattern: Some("yyyy".into()) }
        );
        assert_eq!(FieldRef::parse("plain").date_pattern, None);
    }
}
