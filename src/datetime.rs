use heapless::String;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Wall clock time as kept by the modem's RTC.
///
/// `year` counts from 2000 and `timezone` is in quarter hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Datetime {
    pub year: u8,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub timezone: i8,
}

impl Datetime {
    /// Parse the `+CCLK` payload, `"yy/MM/dd,hh:mm:ss±zz"`, quotes optional.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim_matches('"');
        let mut values = [0i16; 7];
        let mut count = 0;
        let mut current: Option<i16> = None;
        let mut negative = false;

        for c in s.chars() {
            if let Some(d) = c.to_digit(10) {
                current = Some(current.unwrap_or(0).saturating_mul(10).saturating_add(d as i16));
                continue;
            }
            if let Some(v) = current.take() {
                if count == values.len() {
                    return Err(Error::Parse);
                }
                values[count] = if negative { -v } else { v };
                count += 1;
            }
            negative = c == '-';
        }
        if let Some(v) = current {
            if count < values.len() {
                values[count] = if negative { -v } else { v };
                count += 1;
            }
        }

        // Timezone is optional on some firmware.
        if count < 6 {
            return Err(Error::Parse);
        }

        let field = |i: usize| u8::try_from(values[i]).map_err(|_| Error::Parse);
        Ok(Self {
            year: field(0)?,
            month: field(1)?,
            day: field(2)?,
            hour: field(3)?,
            minute: field(4)?,
            second: field(5)?,
            timezone: i8::try_from(values[6]).map_err(|_| Error::Parse)?,
        })
    }

    /// Six printable characters derived from the date and time, usable as a
    /// short unique tag for file names.
    pub fn hash(&self) -> String<6> {
        let bytes = [
            self.year,
            self.month,
            self.day,
            self.hour,
            self.minute,
            self.second,
        ];
        let mut out = String::new();
        for (i, b) in (0u8..).zip(bytes) {
            let mut c = b.wrapping_add(0x41).wrapping_add(i);
            if c > 0x7A {
                c = 0x7A - i;
            }
            if c < 0x30 {
                c = 0x30 + i;
            }
            // always ASCII, and exactly six pushes
            out.push(char::from(c)).ok();
        }
        out
    }
}
