use super::{LevelConfig, Record};

// C1 "next line" followed by a tab. Multi-line messages continue after
// this sequence so grouped output stays indented under its header line.
pub(crate) const NEL_HT: &str = "\x1B\x45\t";

fn color(out: &mut String, lconf: &LevelConfig, code: &str) {
    if !lconf.color.is_empty() {
        out.push_str("\x1B[");
        out.push_str(code);
        out.push('m');
    }
}

/// Composes one finished log line, including the trailing newline.
pub(crate) fn format_record(lconf: &LevelConfig, rec: &Record) -> String {
    let mut out = String::with_capacity(256 + rec.text.len());

    // Timestamp and inverse-video tag first, so lines sort naturally.
    color(&mut out, lconf, &lconf.color);
    out.push_str(&rec.time.format("%Y-%m-%d %H:%M:%S%.9f %z").to_string());
    out.push(' ');

    color(&mut out, lconf, "7");
    out.push_str(&lconf.tag);
    color(&mut out, lconf, "0");
    out.push(' ');

    color(&mut out, lconf, "30;1");
    out.push_str("THREAD ");
    out.push_str(&rec.thrd_lwpid.to_string());
    out.push_str(" \"");
    out.push_str(&rec.thrd_name);
    out.push_str("\" ");

    color(&mut out, lconf, "37;1");
    out.push_str("FUNCTION `");
    out.push_str(&rec.func);
    out.push_str("` ");

    color(&mut out, lconf, "34;1");
    out.push_str("SOURCE '");
    out.push_str(&rec.file);
    out.push(':');
    out.push_str(&rec.line.to_string());
    out.push('\'');
    out.push_str(NEL_HT);

    color(&mut out, lconf, "0");
    color(&mut out, lconf, &lconf.color);
    escape_message(&mut out, lconf, &rec.text);

    // Strip trailing whitespace, then terminate the line.
    let end = out
        .rfind(|ch: char| !matches!(ch, ' ' | '\x0C' | '\n' | '\r' | '\t' | '\x0B'))
        .map(|pos| pos + out[pos..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(0);
    out.truncate(end);

    out.push_str(NEL_HT);
    out.push('\n');
    color(&mut out, lconf, "0");
    out
}

// Non-printable bytes are escaped and rendered inverse-video so they
// cannot forge terminal control sequences. Tabs pass through; newlines
// become NEL+HT so the continuation stays under the message column.
fn escape_message(out: &mut String, lconf: &LevelConfig, text: &str) {
    for ch in text.chars() {
        match ch {
            '\t' => out.push('\t'),
            '\n' => out.push_str(NEL_HT),
            '\0' => escape(out, lconf, "\\0"),
            '\x07' => escape(out, lconf, "\\a"),
            '\x08' => escape(out, lconf, "\\b"),
            '\x0B' => escape(out, lconf, "\\v"),
            '\x0C' => escape(out, lconf, "\\f"),
            '\r' => escape(out, lconf, "\\r"),
            '\x01'..='\x1F' | '\x7F' => {
                let seq = format!("\\x{:02X}", ch as u32);
                escape(out, lconf, &seq);
            }
            _ => out.push(ch),
        }
    }
}

fn escape(out: &mut String, lconf: &LevelConfig, seq: &str) {
    color(out, lconf, "7");
    out.push_str(seq);
    color(out, lconf, "27");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::Level;

    fn record(text: &str) -> Record {
        Record {
            level: Level::Info,
            time: chrono::Local::now(),
            thrd_name: "main".into(),
            thrd_lwpid: 1234,
            func: "poseidon::tests".into(),
            file: "lib.rs".into(),
            line: 42,
            text: text.into(),
        }
    }

    fn plain() -> LevelConfig {
        LevelConfig {
            tag: "[INFO]".into(),
            color: String::new(),
            stdio: None,
            file: String::new(),
            trivial: false,
        }
    }

    #[test]
    fn test_header_fields_present() {
        let line = format_record(&plain(), &record("hello"));
        assert!(line.contains("[INFO]"));
        assert!(line.contains("THREAD 1234 \"main\""));
        assert!(line.contains("FUNCTION `poseidon::tests`"));
        assert!(line.contains("SOURCE 'lib.rs:42'"));
        assert!(line.contains("hello"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn test_no_ansi_when_uncolored() {
        let line = format_record(&plain(), &record("hello"));
        assert!(!line.contains("\x1B["));
    }

    #[test]
    fn test_control_bytes_escaped() {
        let line = format_record(&plain(), &record("a\x01b\rc"));
        assert!(line.contains("a\\x01b\\rc"));
    }

    #[test]
    fn test_newline_becomes_nel_ht() {
        let line = format_record(&plain(), &record("one\ntwo"));
        assert!(line.contains(&format!("one{}two", NEL_HT)));
    }

    #[test]
    fn test_trailing_whitespace_stripped() {
        let line = format_record(&plain(), &record("padded   \t  "));
        assert!(line.contains(&format!("padded{}\n", NEL_HT)));
    }
}
