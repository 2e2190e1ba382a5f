//! Placeholder substitution for definitions and command lines.
//!
//! A template is literal text with `{key}` placeholders resolved against a record.
//! Placeholders take an optional format spec after a colon, using the usual
//! `[[fill]align][sign][#][0][width][,][.precision][type]` mini-language, so
//! `{rep:03d}` pads a replicate number to three digits. `{key[2]}` picks one element
//! of a list value, `{{` and `}}` are literal braces. Lists render as space-separated
//! words.

use crate::record::{Record, Value};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unmatched '{{' at offset {0}")]
    UnmatchedOpen(usize),
    #[error("Single '}}' at offset {0}, use '}}}}' for a literal brace")]
    UnmatchedClose(usize),
    #[error("Placeholder at offset {0} does not name a key")]
    EmptyField(usize),
    #[error("Invalid placeholder '{0}'")]
    InvalidField(String),
    #[error("Invalid format spec '{spec}' for '{field}'")]
    InvalidSpec { field: String, spec: String },
    #[error("Key '{0}' is not present in the record")]
    MissingKey(String),
    #[error("Cannot format '{field}' = '{value}' with spec '{spec}'")]
    Incompatible {
        field: String,
        spec: String,
        value: String,
    },
    #[error("Index {index} is out of range for '{field}'")]
    IndexOutOfRange { field: String, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
    Center,
    /// pad between sign and digits
    SignAware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Sign {
    #[default]
    Minus,
    Plus,
    Space,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct FormatSpec {
    fill: Option<char>,
    align: Option<Align>,
    sign: Sign,
    alternate: bool,
    zero: bool,
    width: Option<usize>,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

fn parse_align(c: char) -> Option<Align> {
    match c {
        '<' => Some(Align::Left),
        '>' => Some(Align::Right),
        '^' => Some(Align::Center),
        '=' => Some(Align::SignAware),
        _ => None,
    }
}

fn take_digits(chars: &[char], pos: &mut usize) -> Option<usize> {
    let start = *pos;
    while *pos < chars.len() && chars[*pos].is_ascii_digit() {
        *pos += 1;
    }

    (start < *pos)
        .then(|| chars[start..*pos].iter().collect::<String>().parse().ok())
        .flatten()
}

impl FormatSpec {
    fn parse(spec: &str) -> Option<Self> {
        let chars: Vec<char> = spec.chars().collect();
        let mut parsed = Self::default();
        let mut pos = 0;

        if chars.len() >= 2 && parse_align(chars[1]).is_some() {
            parsed.fill = Some(chars[0]);
            parsed.align = parse_align(chars[1]);
            pos = 2;
        } else if let Some(align) = chars.first().copied().and_then(parse_align) {
            parsed.align = Some(align);
            pos = 1;
        }

        match chars.get(pos) {
            Some('+') => {
                parsed.sign = Sign::Plus;
                pos += 1;
            }
            Some('-') => pos += 1,
            Some(' ') => {
                parsed.sign = Sign::Space;
                pos += 1;
            }
            _ => {}
        }

        if chars.get(pos) == Some(&'#') {
            parsed.alternate = true;
            pos += 1;
        }

        if chars.get(pos) == Some(&'0') {
            parsed.zero = true;
            pos += 1;
        }

        parsed.width = take_digits(&chars, &mut pos);

        if chars.get(pos) == Some(&',') {
            parsed.grouping = Some(',');
            pos += 1;
        }

        if chars.get(pos) == Some(&'.') {
            pos += 1;
            parsed.precision = Some(take_digits(&chars, &mut pos)?);
        }

        if let Some(&kind) = chars.get(pos) {
            if !"bdeEfFgGosxX".contains(kind) {
                return None;
            }
            parsed.kind = Some(kind);
            pos += 1;
        }

        (pos == chars.len()).then_some(parsed)
    }

    fn is_integer_kind(&self) -> bool {
        matches!(self.kind, Some('b' | 'd' | 'o' | 'x' | 'X'))
    }

    fn is_float_kind(&self) -> bool {
        matches!(self.kind, Some('e' | 'E' | 'f' | 'F' | 'g' | 'G'))
    }
}

/// One `{...}` placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    index: Option<usize>,
    raw_spec: String,
    spec: FormatSpec,
}

impl Field {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// true for a bare `{key}`
    pub fn is_plain(&self) -> bool {
        self.index.is_none() && self.raw_spec.is_empty()
    }

    fn parse(content: &str) -> Result<Self, TemplateError> {
        let (reference, raw_spec) = content.split_once(':').unwrap_or((content, ""));

        let (name, index) = match reference.split_once('[') {
            Some((name, rest)) => {
                let index = rest
                    .strip_suffix(']')
                    .and_then(|index| index.parse().ok())
                    .ok_or_else(|| TemplateError::InvalidField(content.to_string()))?;

                (name, Some(index))
            }
            None => (reference, None),
        };

        if name.is_empty() || name.contains(|c: char| c.is_whitespace() || "!.[]{}".contains(c)) {
            return Err(TemplateError::InvalidField(content.to_string()));
        }

        let spec = FormatSpec::parse(raw_spec).ok_or_else(|| TemplateError::InvalidSpec {
            field: name.to_string(),
            spec: raw_spec.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            index,
            raw_spec: raw_spec.to_string(),
            spec,
        })
    }

    fn resolve(&self, record: &Record) -> Result<Value, TemplateError> {
        let value = record
            .get(&self.name)
            .ok_or_else(|| TemplateError::MissingKey(self.name.clone()))?;

        match self.index {
            None => Ok(value.clone()),
            Some(index) => {
                let elements = value.elements().ok_or_else(|| self.incompatible(value))?;

                elements
                    .into_iter()
                    .nth(index)
                    .ok_or_else(|| TemplateError::IndexOutOfRange {
                        field: self.name.clone(),
                        index,
                    })
            }
        }
    }

    fn incompatible(&self, value: &Value) -> TemplateError {
        TemplateError::Incompatible {
            field: self.name.clone(),
            spec: self.raw_spec.clone(),
            value: value.to_string(),
        }
    }

    fn format(&self, value: &Value) -> Result<String, TemplateError> {
        let spec = &self.spec;

        if spec.is_integer_kind() {
            let number = value.as_int().ok_or_else(|| self.incompatible(value))?;
            return Ok(pad_number(spec, format_integer(spec, number)));
        }

        if spec.is_float_kind() {
            let number = value.as_float().ok_or_else(|| self.incompatible(value))?;
            return Ok(pad_number(spec, format_float(spec, number)));
        }

        match value {
            Value::Int(number) if spec.kind.is_none() => {
                Ok(pad_number(spec, format_integer(spec, *number)))
            }
            Value::Float(number) if spec.kind.is_none() && spec.precision.is_some() => {
                Ok(pad_number(spec, format_float(spec, *number)))
            }
            Value::Float(number) if spec.kind.is_none() => {
                let text = value.to_string();
                Ok(pad_number(
                    spec,
                    split_sign(spec, *number < 0.0, text.trim_start_matches('-')),
                ))
            }
            _ => {
                let mut text = value.to_string();
                if let Some(precision) = spec.precision {
                    text = text.chars().take(precision).collect();
                }
                Ok(pad(spec, "", &text, Align::Left))
            }
        }
    }
}

fn split_sign(spec: &FormatSpec, negative: bool, digits: &str) -> (&'static str, String) {
    let sign = match (negative, spec.sign) {
        (true, _) => "-",
        (false, Sign::Plus) => "+",
        (false, Sign::Space) => " ",
        (false, Sign::Minus) => "",
    };

    (sign, digits.to_string())
}

fn group(digits: &str, separator: char, size: usize) -> String {
    let chars: Vec<char> = digits.chars().collect();
    let mut grouped = String::with_capacity(chars.len() + chars.len() / size);

    for (position, c) in chars.iter().enumerate() {
        if position > 0 && (chars.len() - position) % size == 0 {
            grouped.push(separator);
        }
        grouped.push(*c);
    }

    grouped
}

fn format_integer(spec: &FormatSpec, number: i64) -> (&'static str, String) {
    let magnitude = number.unsigned_abs();

    let (prefix, digits, group_size) = match spec.kind {
        Some('b') => ("0b", format!("{magnitude:b}"), 4),
        Some('o') => ("0o", format!("{magnitude:o}"), 4),
        Some('x') => ("0x", format!("{magnitude:x}"), 4),
        Some('X') => ("0X", format!("{magnitude:X}"), 4),
        _ => ("", magnitude.to_string(), 3),
    };

    let digits = match spec.grouping {
        Some(separator) => group(&digits, separator, group_size),
        None => digits,
    };

    let (sign, digits) = split_sign(spec, number < 0, &digits);
    let prefix = if spec.alternate { prefix } else { "" };

    match (sign, prefix) {
        (sign, "") => (sign, digits),
        ("", prefix) => (prefix, digits),
        // a sign and a prefix both precede the padding
        ("-", prefix) => ("-", format!("{prefix}{digits}")),
        (sign, prefix) => (sign, format!("{prefix}{digits}")),
    }
}

/// exponent with a sign and at least two digits
fn scientific(number: f64, precision: usize, upper: bool) -> String {
    let text = format!("{number:.precision$e}");
    let (mantissa, exponent) = text.split_once('e').unwrap_or((&text, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let sign = if exponent < 0 { '-' } else { '+' };
    let formatted = format!("{mantissa}e{sign}{:02}", exponent.abs());

    if upper {
        formatted.to_uppercase()
    } else {
        formatted
    }
}

fn strip_fraction_zeros(text: &str) -> String {
    let (number, exponent) = match text.find(['e', 'E']) {
        Some(position) => text.split_at(position),
        None => (text, ""),
    };

    let number = if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    };

    format!("{number}{exponent}")
}

fn format_float(spec: &FormatSpec, number: f64) -> (&'static str, String) {
    let magnitude = number.abs();
    let precision = spec.precision.unwrap_or(6);

    let digits = if !magnitude.is_finite() {
        let text = if magnitude.is_nan() { "nan" } else { "inf" };
        if matches!(spec.kind, Some('E' | 'F' | 'G')) {
            text.to_uppercase()
        } else {
            text.to_string()
        }
    } else {
        match spec.kind {
            Some('e') => scientific(magnitude, precision, false),
            Some('E') => scientific(magnitude, precision, true),
            Some('g' | 'G') | None if spec.kind.is_some() || spec.precision.is_some() => {
                let significant = precision.max(1);
                let exponent = if magnitude == 0.0 {
                    0
                } else {
                    magnitude.log10().floor() as i32
                };

                let text = if exponent < -4 || exponent >= significant as i32 {
                    scientific(magnitude, significant - 1, spec.kind == Some('G'))
                } else {
                    let decimals = (significant as i32 - 1 - exponent).max(0) as usize;
                    format!("{magnitude:.decimals$}")
                };

                if spec.alternate {
                    text
                } else {
                    strip_fraction_zeros(&text)
                }
            }
            _ => format!("{magnitude:.precision$}"),
        }
    };

    let digits = match spec.grouping {
        Some(separator) => {
            let (integer, rest) = match digits.find(|c: char| !c.is_ascii_digit()) {
                Some(position) => digits.split_at(position),
                None => (digits.as_str(), ""),
            };
            format!("{}{rest}", group(integer, separator, 3))
        }
        None => digits,
    };

    split_sign(spec, number.is_sign_negative() && !number.is_nan(), &digits)
}

fn pad_number(spec: &FormatSpec, (sign, digits): (&'static str, String)) -> String {
    pad(spec, sign, &digits, Align::Right)
}

fn pad(spec: &FormatSpec, sign: &str, body: &str, default: Align) -> String {
    let (fill, align) = match (spec.fill, spec.align, spec.zero) {
        (fill, Some(align), _) => (fill.unwrap_or(' '), align),
        (_, None, true) => ('0', Align::SignAware),
        (_, None, false) => (' ', default),
    };

    let length = sign.chars().count() + body.chars().count();
    let missing = spec.width.unwrap_or(0).saturating_sub(length);
    let filler = |count: usize| std::iter::repeat(fill).take(count).collect::<String>();

    match align {
        Align::Left => format!("{sign}{body}{}", filler(missing)),
        Align::Right => format!("{}{sign}{body}", filler(missing)),
        Align::Center => format!(
            "{}{sign}{body}{}",
            filler(missing / 2),
            filler(missing - missing / 2)
        ),
        Align::SignAware => format!("{sign}{}{body}", filler(missing)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Field),
}

/// Parsed template, validated once and rendered against many records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((offset, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|(_, next)| *next) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut content = String::new();
                    let mut closed = false;

                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(TemplateError::InvalidField(format!("{content}{{"))),
                            c => content.push(c),
                        }
                    }

                    if !closed {
                        return Err(TemplateError::UnmatchedOpen(offset));
                    }
                    if content.is_empty() {
                        return Err(TemplateError::EmptyField(offset));
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(Field::parse(&content)?));
                }
                '}' if chars.peek().map(|(_, next)| *next) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedClose(offset)),
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Field(field) => Some(field),
            Segment::Literal(_) => None,
        })
    }

    /// the only field if the whole template is a single bare `{key}`
    pub fn single_field(&self) -> Option<&Field> {
        match self.segments.as_slice() {
            [Segment::Field(field)] if field.is_plain() => Some(field),
            _ => None,
        }
    }

    pub fn render(&self, record: &Record) -> Result<String, TemplateError> {
        let mut rendered = String::with_capacity(self.source.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Field(field) => {
                    let value = field.resolve(record)?;
                    rendered.push_str(&field.format(&value)?);
                }
            }
        }

        Ok(rendered)
    }
}

impl FromStr for Template {
    type Err = TemplateError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
