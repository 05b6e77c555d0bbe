//! Character-class escaping for line protocol and InfluxQL.

/// Escapes commas and spaces in a measurement name.
pub fn measurement(s: &str) -> String {
    escape_chars(s, &[',', ' '])
}

/// Escapes commas, equals signs and spaces in tag keys, tag values and
/// field keys.
pub fn tag(s: &str) -> String {
    escape_chars(s, &[',', '=', ' '])
}

/// Wraps `s` in double quotes, escaping embedded quotes and backslashes.
/// Used for string field values and InfluxQL identifiers.
pub fn quoted(s: &str) -> String {
    format!("\"{}\"", escape_chars(s, &['"', '\\']))
}

/// Wraps `s` in single quotes for use as an InfluxQL string literal.
pub fn string_lit(s: &str) -> String {
    format!("'{}'", escape_chars(s, &['\'', '\\']))
}

/// Drops the backslash in front of every escaped character.
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn escape_chars(s: &str, specials: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if specials.contains(&c) {
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
    fn measurement_escapes_comma_and_space() {
        assert_eq!(measurement("cpu load,total=1"), "cpu\\ load\\,total=1");
    }

    #[test]
    fn tag_escapes_equals_too() {
        assert_eq!(tag("a b,c=d"), "a\\ b\\,c\\=d");
        assert_eq!(tag("plain"), "plain");
    }

    #[test]
    fn quoted_escapes_quotes_and_backslashes() {
        assert_eq!(quoted(r#"say "hi" \o/"#), r#""say \"hi\" \\o/""#);
    }

    #[test]
    fn string_lit_escapes_single_quotes() {
        assert_eq!(string_lit("it's"), r"'it\'s'");
    }

    #[test]
    fn unescape_reverses_tag_escaping() {
        for s in ["a b", "x,y", "k=v", " ,= ", "", "trailing "] {
            assert_eq!(unescape(&tag(s)), s);
        }
    }
}
