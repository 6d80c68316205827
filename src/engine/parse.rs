//! Field tokenizer shared by every reply parser.
//!
//! Reply payloads look like `1,"a,b",2`. Fields are split on a delimiter, a
//! double quote toggles "inside string" so quoted delimiters never split, and
//! a `\r` or NUL ends the payload. Surrounding quotes are not part of a field.

use core::str::FromStr;

use crate::error::Error;

/// Iterator over the delimited fields of a payload.
#[derive(Debug, Clone)]
pub struct Fields<'a> {
    rest: Option<&'a str>,
    delimiter: u8,
}

impl<'a> Iterator for Fields<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let s = self.rest?;
        let bytes = s.as_bytes();
        let mut in_str = false;
        let mut end = bytes.len();
        let mut next = None;

        for (i, &b) in bytes.iter().enumerate() {
            match b {
                b'\r' | 0 => {
                    end = i;
                    break;
                }
                b'"' => in_str = !in_str,
                b if b == self.delimiter && !in_str => {
                    end = i;
                    next = Some(&s[i + 1..]);
                    break;
                }
                _ => {}
            }
        }

        self.rest = next;
        Some(unquote(&s[..end]))
    }
}

/// Drop the quotes around a field. Replies never quote inside a field, so
/// this removes every quote; spaces are kept as sent.
fn unquote(field: &str) -> &str {
    field.trim_matches('"')
}

pub fn fields(payload: &str, delimiter: char) -> Fields<'_> {
    Fields {
        rest: Some(payload),
        // Delimiters are always ASCII in AT replies.
        delimiter: delimiter as u8,
    }
}

/// The `index`-th `delimiter`-separated field of `payload`, quotes removed.
pub fn parse_delimited(payload: &str, index: usize, delimiter: char) -> Option<&str> {
    fields(payload, delimiter).nth(index)
}

/// The `index`-th comma-separated field parsed as a number. Padding
/// around the digits is ignored.
pub fn parse_field<N: FromStr>(payload: &str, index: usize) -> Result<N, Error> {
    parse_delimited(payload, index, ',')
        .ok_or(Error::Parse)?
        .trim()
        .parse()
        .map_err(|_| Error::Parse)
}
