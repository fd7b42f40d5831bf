use std::collections::BTreeMap;
use std::fmt::Write;

use crate::batch::Precision;
use crate::point::{FieldValue, Point};

pub(crate) fn write_point(buf: &mut String, point: &Point, precision: Precision) {
    escape_measurement(buf, point.measurement());
    write_tags(buf, point.tags());
    buf.push(' ');
    write_fields(buf, point.fields());
    let _ = writeln!(buf, " {}", precision.timestamp(point.since_epoch()));
}

fn write_tags(buf: &mut String, tags: &BTreeMap<String, String>) {
    for (key, value) in tags {
        buf.push(',');
        escape_key(buf, key);
        buf.push('=');
        escape_key(buf, value);
    }
}

fn write_fields(buf: &mut String, fields: &BTreeMap<String, FieldValue>) {
    for (i, (key, value)) in fields.iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        escape_key(buf, key);
        buf.push('=');
        write_field_value(buf, value);
    }
}

fn write_field_value(buf: &mut String, value: &FieldValue) {
    let _ = match value {
        FieldValue::Float(v) => write!(buf, "{v}"),
        FieldValue::Integer(v) => write!(buf, "{v}i"),
        FieldValue::UInteger(v) => write!(buf, "{v}u"),
        FieldValue::Boolean(v) => write!(buf, "{v}"),
        FieldValue::String(v) => {
            buf.push('"');
            escape_string(buf, v);
            buf.push('"');

            Ok(())
        }
    };
}

fn escape_measurement(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            ',' | ' ' | '\\' => {
                buf.push('\\');
                buf.push(c);
            }
            _ => buf.push(c),
        }
    }
}

/// Escapes tag keys, tag values and field keys.
fn escape_key(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            ',' | '=' | ' ' | '\\' => {
                buf.push('\\');
                buf.push(c);
            }
            _ => buf.push(c),
        }
    }
}

fn escape_string(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' | '\\' => {
                buf.push('\\');
                buf.push(c);
            }
            _ => buf.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use expect_test::expect;

    use super::*;

    fn empty_tags() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn sample_tags() -> BTreeMap<String, String> {
        BTreeMap::from_iter([
            ("host".to_string(), "server01".to_string()),
            ("region".to_string(), "us-east".to_string()),
        ])
    }

    fn value(v: impl Into<FieldValue>) -> BTreeMap<String, FieldValue> {
        BTreeMap::from_iter([("value".to_string(), v.into())])
    }

    fn encode(
        measurement: &str,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        precision: Precision,
    ) -> String {
        let point = Point::new(
            measurement,
            tags,
            fields,
            UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789),
        )
        .unwrap();
        let mut buf = String::new();
        write_point(&mut buf, &point, precision);

        buf
    }

    #[test]
    fn float_basic() {
        expect!["temperature,host=server01,region=us-east value=23.5 1700000000123456789\n"]
            .assert_eq(&encode("temperature", sample_tags(), value(23.5), Precision::Nanoseconds));
    }

    #[test]
    fn integer_and_unsigned() {
        let fields = BTreeMap::from_iter([
            ("charge".to_string(), FieldValue::Integer(-4)),
            ("count".to_string(), FieldValue::UInteger(42)),
        ]);

        expect!["m charge=-4i,count=42u 1700000000\n"].assert_eq(&encode(
            "m",
            empty_tags(),
            fields,
            Precision::Seconds,
        ));
    }

    #[test]
    fn boolean_and_string() {
        let fields = BTreeMap::from_iter([
            ("ok".to_string(), FieldValue::Boolean(true)),
            ("note".to_string(), FieldValue::from(r#"say "hi" \o/"#)),
        ]);

        expect![[r#"
            m note="say \"hi\" \\o/",ok=true 1700000000123
        "#]]
        .assert_eq(&encode("m", empty_tags(), fields, Precision::Milliseconds));
    }

    #[test]
    fn coarse_precision() {
        expect!["m value=1 472222\n"].assert_eq(&encode(
            "m",
            empty_tags(),
            value(1.0),
            Precision::Hours,
        ));
    }

    #[test]
    fn escape_measurement_special_chars() {
        expect!["req\\,count\\ total value=1i 1700000000\n"].assert_eq(&encode(
            "req,count total",
            empty_tags(),
            value(1_i64),
            Precision::Seconds,
        ));
    }

    #[test]
    fn escape_tag_special_chars() {
        let tags = BTreeMap::from_iter([("host name".to_string(), "server=01,a".to_string())]);

        expect!["m,host\\ name=server\\=01\\,a value=1i 1700000000\n"].assert_eq(&encode(
            "m",
            tags,
            value(1_i64),
            Precision::Seconds,
        ));
    }

    #[test]
    fn escape_field_key() {
        let fields = BTreeMap::from_iter([("a b=c".to_string(), FieldValue::Integer(1))]);

        expect!["m a\\ b\\=c=1i 1700000000\n"].assert_eq(&encode(
            "m",
            empty_tags(),
            fields,
            Precision::Seconds,
        ));
    }

    #[test]
    fn backslash_in_measurement() {
        expect!["path\\\\metric value=1i 1700000000\n"].assert_eq(&encode(
            "path\\metric",
            empty_tags(),
            value(1_i64),
            Precision::Seconds,
        ));
    }

    #[test]
    fn backslash_in_tag() {
        let tags = BTreeMap::from_iter([("k\\ey".to_string(), "v\\al".to_string())]);

        expect!["m,k\\\\ey=v\\\\al value=1i 1700000000\n"].assert_eq(&encode(
            "m",
            tags,
            value(1_i64),
            Precision::Seconds,
        ));
    }

    #[test]
    fn multiple_writes_accumulate() {
        let mut buf = String::new();
        for (name, v) in [("a", 1.0), ("b", 2.5)] {
            let timestamp = UNIX_EPOCH + Duration::from_secs(100);
            let point = Point::new(name, empty_tags(), value(v), timestamp).unwrap();
            write_point(&mut buf, &point, Precision::Seconds);
        }

        expect![[r#"
            a value=1 100
            b value=2.5 100
        "#]]
        .assert_eq(&buf);
    }
}
