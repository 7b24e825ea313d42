//! External subtitle parsing - WebVTT and SRT
//!
//! ```rust
//! use vireo_core::subtitle::parse_subtitle;
//!
//! let srt = "1\n00:00:01,000 --> 00:00:02,500\nHello!\n";
//! let cues = parse_subtitle(srt).unwrap();
//! assert_eq!(cues[0].start_ms, 1000);
//! assert_eq!(cues[0].end_ms, 2500);
//! ```

use crate::error::{Error, Result};
use crate::types::TextCue;

/// Parse a subtitle document, detecting WebVTT by its header and
/// falling back to SRT
pub fn parse_subtitle(input: &str) -> Result<Vec<TextCue>> {
    let input = input.trim_start_matches('\u{feff}');
    let cues = if input.starts_with("WEBVTT") {
        WebVttParser::parse(input)?
    } else {
        SrtParser::parse(input)?
    };
    if cues.is_empty() {
        return Err(Error::SubtitleParse("no cues found".to_string()));
    }
    Ok(cues)
}

/// Codec name of a parsed document, as reported in its stream info
pub fn subtitle_codec(input: &str) -> &'static str {
    if input.trim_start_matches('\u{feff}').starts_with("WEBVTT") {
        "webvtt"
    } else {
        "srt"
    }
}

/// Index of the cue active at `position_ms`, if any
pub fn active_cue(cues: &[TextCue], position_ms: i64) -> Option<usize> {
    cues.iter().position(|c| c.is_active_at(position_ms))
}

/// WebVTT parser
pub struct WebVttParser;

impl WebVttParser {
    /// Parse a WebVTT string into a list of cues
    pub fn parse(input: &str) -> Result<Vec<TextCue>> {
        let mut cues = Vec::new();
        let mut lines = input.lines().peekable();

        let header = lines.next().unwrap_or("");
        if !header.starts_with("WEBVTT") {
            return Err(Error::SubtitleParse("missing WEBVTT header".to_string()));
        }

        // Header metadata runs until the first blank line
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
        }

        let mut counter = 0;
        while lines.peek().is_some() {
            while lines.peek().is_some_and(|l| l.trim().is_empty()) {
                lines.next();
            }
            let Some(first) = lines.next() else {
                break;
            };

            // NOTE, STYLE and REGION blocks carry no cues
            if ["NOTE", "STYLE", "REGION"].iter().any(|k| first.starts_with(k)) {
                for line in lines.by_ref() {
                    if line.trim().is_empty() {
                        break;
                    }
                }
                continue;
            }

            let (id, timing) = if first.contains("-->") {
                (None, first)
            } else {
                (Some(first.trim().to_string()), lines.next().unwrap_or(""))
            };
            if !timing.contains("-->") {
                continue;
            }

            let (start_ms, end_ms) = parse_timing_line(timing)?;
            let text = collect_text(&mut lines);

            counter += 1;
            cues.push(TextCue {
                id: id.unwrap_or_else(|| format!("cue-{}", counter)),
                start_ms,
                end_ms,
                text: strip_tags(&text),
            });
        }

        Ok(cues)
    }
}

/// SRT (SubRip) parser
pub struct SrtParser;

impl SrtParser {
    /// Parse an SRT string into a list of cues
    pub fn parse(input: &str) -> Result<Vec<TextCue>> {
        let mut cues = Vec::new();
        let mut lines = input.lines().peekable();

        while lines.peek().is_some() {
            while lines.peek().is_some_and(|l| l.trim().is_empty()) {
                lines.next();
            }
            let Some(number) = lines.next().map(str::trim) else {
                break;
            };
            let Some(timing) = lines.next() else {
                break;
            };
            if !timing.contains("-->") {
                continue;
            }

            let (start_ms, end_ms) = parse_timing_line(timing)?;
            let text = collect_text(&mut lines);

            cues.push(TextCue {
                id: format!("srt-{}", number),
                start_ms,
                end_ms,
                text: strip_tags(&text),
            });
        }

        Ok(cues)
    }
}

fn collect_text<'a>(lines: &mut std::iter::Peekable<impl Iterator<Item = &'a str>>) -> String {
    let mut text = String::new();
    while let Some(line) = lines.next_if(|l| !l.trim().is_empty()) {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(line);
    }
    text
}

/// "00:00:01.000 --> 00:00:04.000 align:center"; settings are ignored
fn parse_timing_line(line: &str) -> Result<(i64, i64)> {
    let (start, rest) = line
        .split_once("-->")
        .ok_or_else(|| Error::SubtitleParse(format!("invalid timing line: {}", line)))?;
    let end = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| Error::SubtitleParse(format!("missing end time: {}", line)))?;

    let start_ms = parse_timestamp(start.trim())?;
    let end_ms = parse_timestamp(end)?;
    if end_ms < start_ms {
        return Err(Error::SubtitleParse(format!("cue ends before it starts: {}", line)));
    }
    Ok((start_ms, end_ms))
}

/// "hh:mm:ss.mmm", "mm:ss.mmm", with '.' or ',' before the milliseconds
fn parse_timestamp(ts: &str) -> Result<i64> {
    let invalid = || Error::SubtitleParse(format!("invalid timestamp: {}", ts));

    let parts: Vec<&str> = ts.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => (0, m.parse::<i64>().map_err(|_| invalid())?, *s),
        [h, m, s] => (
            h.parse::<i64>().map_err(|_| invalid())?,
            m.parse::<i64>().map_err(|_| invalid())?,
            *s,
        ),
        _ => return Err(invalid()),
    };

    let (secs, millis) = match seconds.split_once(['.', ',']) {
        Some((s, ms)) => {
            let ms_value: i64 = ms.parse().map_err(|_| invalid())?;
            // "5.5" means 500 ms
            let scale = match ms.len() {
                1 => 100,
                2 => 10,
                3 => 1,
                _ => return Err(invalid()),
            };
            (s.parse::<i64>().map_err(|_| invalid())?, ms_value * scale)
        }
        None => (seconds.parse::<i64>().map_err(|_| invalid())?, 0),
    };

    Ok(((hours * 60 + minutes) * 60 + secs) * 1000 + millis)
}

/// Strip markup tags from cue text
pub fn strip_tags(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut in_tag = false;

    for ch in text.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webvtt() {
        let vtt = r#"WEBVTT
Kind: captions

NOTE this is a comment

intro
00:00:00.000 --> 00:00:04.000 align:center
Hello, <b>world</b>!

00:04.000 --> 00:00:08.500
This is a subtitle.
Second line.
"#;

        let cues = WebVttParser::parse(vtt).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].id, "intro");
        assert_eq!(cues[0].text, "Hello, world!");
        assert_eq!((cues[0].start_ms, cues[0].end_ms), (0, 4000));
        assert_eq!(cues[1].id, "cue-2");
        assert_eq!(cues[1].end_ms, 8500);
        assert_eq!(cues[1].text, "This is a subtitle.\nSecond line.");
    }

    #[test]
    fn test_parse_srt() {
        let srt = "1\r\n00:00:00,000 --> 00:00:04,000\r\nHello, world!\r\n\r\n2\r\n00:00:04,000 --> 00:00:08,000\r\nThis is a subtitle.\r\n";

        let cues = SrtParser::parse(srt).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].id, "srt-1");
        assert_eq!(cues[0].text, "Hello, world!");
        assert_eq!(cues[1].start_ms, 4000);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(parse_timestamp("00:00:05.500").unwrap(), 5500);
        assert_eq!(parse_timestamp("01:30:00,000").unwrap(), 5_400_000);
        assert_eq!(parse_timestamp("05:30.000").unwrap(), 330_000);
        assert!(parse_timestamp("5").is_err());
        assert!(parse_timestamp("aa:00.000").is_err());
    }

    #[test]
    fn test_detection_and_active_cue() {
        assert_eq!(subtitle_codec("WEBVTT\n"), "webvtt");
        assert_eq!(subtitle_codec("1\n00:00:00,000 --> 00:00:01,000\nx\n"), "srt");

        let cues = parse_subtitle("1\n00:00:01,000 --> 00:00:02,000\nx\n").unwrap();
        assert_eq!(active_cue(&cues, 500), None);
        assert_eq!(active_cue(&cues, 1000), Some(0));
        assert_eq!(active_cue(&cues, 2000), None);
    }

    #[test]
    fn test_empty_document() {
        assert!(matches!(parse_subtitle("WEBVTT\n\n"), Err(Error::SubtitleParse(_))));
        assert!(WebVttParser::parse("not vtt").is_err());
    }
}
