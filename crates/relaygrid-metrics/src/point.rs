//! InfluxDB line protocol rendering.
//!
//! Points are rendered with second precision:
//! `measurement,tag=v field=1i,other="s" 1700000000`.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    /// Numeric value for aggregation; strings and bools have none.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Float(v) => Some(v.round() as i64),
            FieldValue::Bool(_) | FieldValue::Str(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            FieldValue::Int(v) => format!("{v}i"),
            FieldValue::Float(v) => format!("{v}"),
            FieldValue::Bool(v) => format!("{v}"),
            FieldValue::Str(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

/// A single time-series sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Unix seconds.
    pub timestamp: u64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: u64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    /// Add a tag. Empty values are dropped; the line protocol has no empty tags.
    pub fn tag(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let value = value.to_string();
        if !value.is_empty() {
            self.tags.insert(key.into(), value);
        }
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Render one line of line protocol, or `None` for a point with no fields.
    pub fn to_line(&self) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }
        let mut out = escape(&self.measurement, &[',', ' ']);
        for (k, v) in &self.tags {
            out.push(',');
            out.push_str(&escape(k, &[',', '=', ' ']));
            out.push('=');
            out.push_str(&escape(v, &[',', '=', ' ']));
        }
        out.push(' ');
        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{}={}", escape(k, &[',', '=', ' ']), v.render()))
            .collect();
        out.push_str(&fields.join(","));
        out.push(' ');
        out.push_str(&self.timestamp.to_string());
        Some(out)
    }
}

/// Render a batch, one point per line.
pub fn render_lines(points: &[Point]) -> String {
    points
        .iter()
        .filter_map(Point::to_line)
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_usage_point() {
        let line = Point::new("xray_usage", 1_700_000_000)
            .tag("usage_type", "user")
            .tag("period_id", 42)
            .field("dl_bytes", 1024u64)
            .field("up_bytes", 10u64)
            .to_line()
            .unwrap();
        assert_eq!(
            line,
            "xray_usage,period_id=42,usage_type=user dl_bytes=1024i,up_bytes=10i 1700000000"
        );
    }

    #[test]
    fn escapes_special_characters() {
        let line = Point::new("connection health", 5)
            .tag("connection_name", "a b,c=d")
            .field("reason", "say \"hi\"")
            .to_line()
            .unwrap();
        assert_eq!(
            line,
            r#"connection\ health,connection_name=a\ b\,c\=d reason="say \"hi\"" 5"#
        );
    }

    #[test]
    fn drops_empty_tags_and_fieldless_points() {
        let p = Point::new("m", 1).tag("empty", "");
        assert!(p.tags.is_empty());
        assert!(p.to_line().is_none());
    }

    #[test]
    fn render_lines_joins_batch() {
        let points = vec![
            Point::new("m", 1).field("v", true),
            Point::new("m", 2),
            Point::new("m", 3).field("v", 1.5),
        ];
        assert_eq!(render_lines(&points), "m v=true 1\nm v=1.5 3");
    }
}
