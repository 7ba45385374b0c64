//! Structured value printer for debug-printf payloads.
//!
//! A format string is parsed once into segments. Each segment is a literal
//! prefix followed by at most one conversion; `%v<N><conv>` expands into `N`
//! conversions joined by `", "`, so rendering never special-cases vectors.
//!
//! Shader code writes one word per 32-bit value and two words (low first) per
//! 64-bit value. Whether a float was 64-bit, or a signed integer came from an
//! 8/16-bit variable, is not recoverable from the format string and arrives
//! as bitmasks indexed by value position ([`ValueMasks`]).

use crate::error::PrintfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    Signed,
    Unsigned,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecFlags {
    pub left: bool,
    pub plus: bool,
    pub space: bool,
    pub alt: bool,
    pub zero: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub flags: SpecFlags,
    pub width: Option<usize>,
    pub precision: Option<usize>,
    pub kind: NumericKind,
    /// Integer conversions with an `l`/`ll` length modifier read two words.
    pub is_64bit: bool,
    pub conv: char,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub literal: String,
    pub conversion: Option<Conversion>,
}

impl Segment {
    pub fn consumes_value(&self) -> bool {
        self.conversion.is_some()
    }
}

/// Per-value width hints written next to the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueMasks {
    pub float64: u32,
    pub signed8: u32,
    pub signed16: u32,
}

impl ValueMasks {
    fn bit(mask: u32, index: usize) -> bool {
        index < 32 && mask & (1 << index) != 0
    }

    pub fn is_float64(&self, index: usize) -> bool {
        Self::bit(self.float64, index)
    }

    pub fn is_signed8(&self, index: usize) -> bool {
        Self::bit(self.signed8, index)
    }

    pub fn is_signed16(&self, index: usize) -> bool {
        Self::bit(self.signed16, index)
    }
}

/// Cursor over the raw payload bytes written by shader code.
#[derive(Debug, Clone)]
pub struct PayloadCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> PayloadCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn from_words(words: &'a [u32]) -> Self {
        Self::new(bytemuck::cast_slice(words))
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn words_consumed(&self) -> usize {
        self.offset / 4
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take<const N: usize>(&mut self, value: usize) -> Result<[u8; N], PrintfError> {
        let end = self.offset + N;
        match self.bytes.get(self.offset..end) {
            Some(slice) => {
                let mut out = [0u8; N];
                out.copy_from_slice(slice);
                self.offset = end;
                Ok(out)
            }
            None => Err(PrintfError::PayloadExhausted {
                value,
                needed: N,
                available: self.remaining(),
            }),
        }
    }

    pub fn read_u32(&mut self, value: usize) -> Result<u32, PrintfError> {
        self.take::<4>(value).map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self, value: usize) -> Result<u64, PrintfError> {
        self.take::<8>(value).map(u64::from_le_bytes)
    }
}

#[derive(Debug, Clone, Copy)]
enum Value {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

/// A parsed format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatString {
    source: String,
    segments: Vec<Segment>,
}

impl FormatString {
    pub fn parse(source: &str) -> Result<Self, PrintfError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((start, c)) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            match chars.peek() {
                None => return Err(PrintfError::UnterminatedConversion(start)),
                Some(&(_, '%')) => {
                    chars.next();
                    literal.push('%');
                    continue;
                }
                Some(_) => {}
            }

            let mut vector = 1u32;
            if let Some(&(_, 'v')) = chars.peek() {
                chars.next();
                let mut n = 0u32;
                let mut saw_digit = false;
                while let Some(&(_, d)) = chars.peek() {
                    match d.to_digit(10) {
                        Some(v) => {
                            n = n.saturating_mul(10).saturating_add(v);
                            saw_digit = true;
                            chars.next();
                        }
                        None => break,
                    }
                }
                if !saw_digit || !(2..=4).contains(&n) {
                    return Err(PrintfError::BadVectorWidth(n));
                }
                vector = n;
            }

            let mut flags = SpecFlags::default();
            while let Some(&(_, f)) = chars.peek() {
                match f {
                    '-' => flags.left = true,
                    '+' => flags.plus = true,
                    ' ' => flags.space = true,
                    '#' => flags.alt = true,
                    '0' => flags.zero = true,
                    _ => break,
                }
                chars.next();
            }

            let width = parse_number(&mut chars);
            let precision = match chars.peek() {
                Some(&(_, '.')) => {
                    chars.next();
                    Some(parse_number(&mut chars).unwrap_or(0))
                }
                _ => None,
            };

            let mut is_64bit = false;
            while let Some(&(_, m)) = chars.peek() {
                match m {
                    'l' => is_64bit = true,
                    'h' => {}
                    _ => break,
                }
                chars.next();
            }

            let conv = match chars.next() {
                Some((_, conv)) => conv,
                None => return Err(PrintfError::UnterminatedConversion(start)),
            };
            let kind = match conv {
                'd' | 'i' => NumericKind::Signed,
                'u' | 'x' | 'X' | 'o' | 'c' => NumericKind::Unsigned,
                'f' | 'F' | 'e' | 'E' | 'g' | 'G' | 'a' | 'A' => NumericKind::Float,
                other => return Err(PrintfError::UnsupportedConversion(other)),
            };

            let conversion = Conversion {
                flags,
                width,
                precision,
                kind,
                is_64bit: is_64bit && kind != NumericKind::Float,
                conv,
            };
            segments.push(Segment {
                literal: std::mem::take(&mut literal),
                conversion: Some(conversion.clone()),
            });
            for _ in 1..vector {
                segments.push(Segment {
                    literal: ", ".to_string(),
                    conversion: Some(conversion.clone()),
                });
            }
        }

        if !literal.is_empty() {
            segments.push(Segment {
                literal,
                conversion: None,
            });
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of payload values the string consumes.
    pub fn value_count(&self) -> usize {
        self.segments.iter().filter(|s| s.consumes_value()).count()
    }

    /// Render against `cursor`, advancing it by one or two words per value.
    pub fn render(
        &self,
        cursor: &mut PayloadCursor<'_>,
        masks: ValueMasks,
    ) -> Result<String, PrintfError> {
        let mut out = String::with_capacity(self.source.len() + 16);
        let mut index = 0usize;
        for segment in &self.segments {
            out.push_str(&segment.literal);
            let Some(conv) = &segment.conversion else {
                continue;
            };
            let value = read_value(conv, cursor, masks, index)?;
            out.push_str(&format_value(conv, value));
            index += 1;
        }
        Ok(out)
    }

    /// Render from a word slice; returns the text and the words consumed.
    pub fn render_words(
        &self,
        words: &[u32],
        masks: ValueMasks,
    ) -> Result<(String, usize), PrintfError> {
        let mut cursor = PayloadCursor::from_words(words);
        let text = self.render(&mut cursor, masks)?;
        Ok((text, cursor.words_consumed()))
    }
}

fn parse_number(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> Option<usize> {
    let mut value: Option<usize> = None;
    while let Some(&(_, d)) = chars.peek() {
        match d.to_digit(10) {
            Some(v) => {
                value = Some(value.unwrap_or(0).saturating_mul(10).saturating_add(v as usize));
                chars.next();
            }
            None => break,
        }
    }
    value
}

fn read_value(
    conv: &Conversion,
    cursor: &mut PayloadCursor<'_>,
    masks: ValueMasks,
    index: usize,
) -> Result<Value, PrintfError> {
    Ok(match conv.kind {
        NumericKind::Signed => {
            if conv.is_64bit {
                Value::Signed(cursor.read_u64(index)? as i64)
            } else {
                let word = cursor.read_u32(index)?;
                let v = if masks.is_signed8(index) {
                    i64::from(word as u8 as i8)
                } else if masks.is_signed16(index) {
                    i64::from(word as u16 as i16)
                } else {
                    i64::from(word as i32)
                };
                Value::Signed(v)
            }
        }
        NumericKind::Unsigned => {
            if conv.is_64bit {
                Value::Unsigned(cursor.read_u64(index)?)
            } else {
                Value::Unsigned(u64::from(cursor.read_u32(index)?))
            }
        }
        NumericKind::Float => {
            if masks.is_float64(index) {
                Value::Float(f64::from_bits(cursor.read_u64(index)?))
            } else {
                Value::Float(f64::from(f32::from_bits(cursor.read_u32(index)?)))
            }
        }
    })
}

fn format_value(conv: &Conversion, value: Value) -> String {
    match value {
        Value::Signed(v) => format_integer(conv, v < 0, v.unsigned_abs()),
        Value::Unsigned(v) if conv.conv == 'c' => {
            let c = char::from_u32(v as u32).unwrap_or(char::REPLACEMENT_CHARACTER);
            pad(conv, "", "", &c.to_string(), false)
        }
        Value::Unsigned(v) => format_integer(conv, false, v),
        Value::Float(v) => format_float(conv, v),
    }
}

fn sign_prefix(flags: &SpecFlags, negative: bool) -> &'static str {
    if negative {
        "-"
    } else if flags.plus {
        "+"
    } else if flags.space {
        " "
    } else {
        ""
    }
}

fn format_integer(conv: &Conversion, negative: bool, magnitude: u64) -> String {
    let mut digits = match conv.conv {
        'x' => format!("{magnitude:x}"),
        'X' => format!("{magnitude:X}"),
        'o' => format!("{magnitude:o}"),
        _ => magnitude.to_string(),
    };
    if let Some(p) = conv.precision {
        if p == 0 && magnitude == 0 {
            digits.clear();
        } else if digits.len() < p {
            digits = format!("{}{}", "0".repeat(p - digits.len()), digits);
        }
    }
    let prefix = match conv.conv {
        'x' if conv.flags.alt && magnitude != 0 => "0x",
        'X' if conv.flags.alt && magnitude != 0 => "0X",
        'o' if conv.flags.alt && !digits.starts_with('0') => "0",
        _ => "",
    };
    let sign = match conv.kind {
        NumericKind::Signed => sign_prefix(&conv.flags, negative),
        _ => "",
    };
    pad(conv, sign, prefix, &digits, conv.precision.is_none())
}

fn format_float(conv: &Conversion, v: f64) -> String {
    let upper = conv.conv.is_ascii_uppercase();
    let negative = v.is_sign_negative() && !v.is_nan();
    let sign = sign_prefix(&conv.flags, negative);
    let a = v.abs();

    if !a.is_finite() {
        let body = if a.is_nan() { "nan" } else { "inf" };
        let body = if upper { body.to_ascii_uppercase() } else { body.to_string() };
        return pad(conv, sign, "", &body, false);
    }

    let precision = conv.precision.unwrap_or(6);
    let alt = conv.flags.alt;
    let (prefix, body) = match conv.conv.to_ascii_lowercase() {
        'e' => ("", fmt_exponent(a, precision, alt)),
        'g' => ("", fmt_general(a, precision, alt)),
        'a' => (if upper { "0X" } else { "0x" }, fmt_hex(a, conv.precision)),
        _ => ("", fmt_fixed(a, precision, alt)),
    };
    let body = if upper { body.to_ascii_uppercase() } else { body };
    pad(conv, sign, prefix, &body, true)
}

fn fmt_fixed(a: f64, precision: usize, alt: bool) -> String {
    let mut s = format!("{a:.precision$}");
    if alt && precision == 0 {
        s.push('.');
    }
    s
}

fn fmt_exponent(a: f64, precision: usize, alt: bool) -> String {
    let s = format!("{a:.precision$e}");
    let (mantissa, exp) = match s.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (s.clone(), 0),
    };
    let mut mantissa = mantissa;
    if alt && precision == 0 {
        mantissa.push('.');
    }
    let sign = if exp < 0 { '-' } else { '+' };
    format!("{}e{}{:02}", mantissa, sign, exp.unsigned_abs())
}

fn decimal_exponent(a: f64, significant: usize) -> i32 {
    if a == 0.0 {
        return 0;
    }
    let digits = significant.saturating_sub(1);
    let s = format!("{a:.digits$e}");
    s.split_once('e')
        .and_then(|(_, e)| e.parse::<i32>().ok())
        .unwrap_or(0)
}

fn fmt_general(a: f64, precision: usize, alt: bool) -> String {
    let p = precision.max(1);
    let x = decimal_exponent(a, p);
    let s = if x < p as i32 && x >= -4 {
        fmt_fixed(a, (p as i32 - 1 - x) as usize, alt)
    } else {
        fmt_exponent(a, p - 1, alt)
    };
    if alt {
        s
    } else {
        strip_trailing_zeros(s)
    }
}

fn strip_trailing_zeros(s: String) -> String {
    let (mantissa, exp) = match s.find('e') {
        Some(i) => (&s[..i], &s[i..]),
        None => (s.as_str(), ""),
    };
    if !mantissa.contains('.') {
        return s;
    }
    let trimmed = mantissa.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed}{exp}")
}

fn fmt_hex(a: f64, precision: Option<usize>) -> String {
    if a == 0.0 {
        return match precision {
            Some(p) if p > 0 => format!("0.{}p+0", "0".repeat(p)),
            _ => "0p+0".to_string(),
        };
    }
    let bits = a.to_bits();
    let raw_exp = ((bits >> 52) & 0x7ff) as i32;
    let mut mantissa = bits & ((1u64 << 52) - 1);
    let (mut lead, exp) = if raw_exp == 0 {
        (0u64, -1022)
    } else {
        (1u64, raw_exp - 1023)
    };

    let hex = match precision {
        Some(p) if p < 13 => {
            let shift = (13 - p) * 4;
            let rounded = (mantissa + (1u64 << (shift - 1))) >> shift;
            let limit = 1u64 << (p * 4);
            if rounded >= limit {
                lead += 1;
                mantissa = rounded - limit;
            } else {
                mantissa = rounded;
            }
            if p == 0 {
                String::new()
            } else {
                format!("{mantissa:0p$x}")
            }
        }
        Some(p) => format!("{mantissa:013x}{}", "0".repeat(p - 13)),
        None => format!("{mantissa:013x}").trim_end_matches('0').to_string(),
    };

    let sign = if exp < 0 { '-' } else { '+' };
    if hex.is_empty() {
        format!("{lead}p{sign}{}", exp.unsigned_abs())
    } else {
        format!("{lead}.{hex}p{sign}{}", exp.unsigned_abs())
    }
}

fn pad(conv: &Conversion, sign: &str, prefix: &str, body: &str, zero_allowed: bool) -> String {
    let len = sign.len() + prefix.len() + body.chars().count();
    let width = conv.width.unwrap_or(0);
    if len >= width {
        return format!("{sign}{prefix}{body}");
    }
    let fill = width - len;
    if conv.flags.left {
        format!("{sign}{prefix}{body}{}", " ".repeat(fill))
    } else if conv.flags.zero && zero_allowed {
        format!("{sign}{prefix}{}{body}", "0".repeat(fill))
    } else {
        format!("{}{sign}{prefix}{body}", " ".repeat(fill))
    }
}
