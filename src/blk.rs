//! Patching of the host's `config.blk`.
//!
//! The format is a loose tree of `name{ ... }` blocks holding
//! `key:type=value` lines. Only `enable_mod:b` inside the top-level `sound`
//! block is ever written; everything else is passed through untouched.

use anyhow::{Context, Result};
use log::debug;
use std::{fs, path::Path};

const BLOCK_NAME: &str = "sound";
const FLAG_KEY: &str = "enable_mod";
const FLAG_TYPE: &str = "b";
const COMPANION_LINE: &str = "fmod_sound_enable:b=yes";
const DEFAULT_INDENT: &str = "  ";

#[derive(Debug, Default)]
struct Location {
    block_open: Option<usize>,
    /// The block opens and closes on the same line, e.g. `sound{}`.
    block_inline: bool,
    key_line: Option<usize>,
}

fn flag_value(enabled: bool) -> &'static str {
    if enabled {
        "yes"
    } else {
        "no"
    }
}

fn flag_line(indent: &str, enabled: bool) -> String {
    format!("{indent}{FLAG_KEY}:{FLAG_TYPE}={}", flag_value(enabled))
}

fn is_flag_line(line: &str) -> bool {
    line.trim_start()
        .strip_prefix(FLAG_KEY)
        .map(|rest| rest.starts_with(':'))
        .unwrap_or(false)
}

fn locate(lines: &[String]) -> Location {
    let mut location = Location::default();
    let mut stack: Vec<String> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let opens = trimmed.matches('{').count();
        let closes = trimmed.matches('}').count();

        if opens == 0
            && closes == 0
            && stack.len() == 1
            && stack[0] == BLOCK_NAME
            && location.key_line.is_none()
            && is_flag_line(line)
        {
            location.key_line = Some(idx);
        }

        if opens > 0 {
            let name = trimmed.split('{').next().unwrap_or("").trim().to_string();
            if stack.is_empty() && name == BLOCK_NAME && location.block_open.is_none() {
                location.block_open = Some(idx);
            }
            stack.push(name);
            for _ in 1..opens {
                stack.push(String::new());
            }
        }
        for _ in 0..closes {
            stack.pop();
        }
        if location.block_open == Some(idx) && stack.is_empty() {
            location.block_inline = true;
        }
    }

    location
}

/// Splits `sound{ ... }` into the opening, the inner text and the closing.
fn split_inline(body: &str) -> Option<(&str, &str, &str)> {
    let open = body.find('{')?;
    let close = body.rfind('}')?;
    (close > open).then(|| (&body[..=open], &body[open + 1..close], &body[close..]))
}

fn value_is_on(body: &str) -> Option<bool> {
    let value = body.split('=').nth(1)?.trim().trim_matches('"');
    Some(matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "true" | "1" | "on"
    ))
}

/// Expands a one-line block into one entry per line with the flag inside.
fn expand_inline(line: &str, enabled: bool) -> Option<Vec<String>> {
    let (body, cr) = split_cr(line);
    let (head, inner, tail) = split_inline(body)?;
    let inner = inner.trim();
    if is_flag_line(inner) && rewrite_value(inner, enabled) == inner {
        return None;
    }

    let indent = &body[..body.len() - body.trim_start().len()];
    let inner_indent = format!("{indent}{DEFAULT_INDENT}");
    let mut expanded = vec![format!("{}{cr}", head.trim_end())];
    if !inner.is_empty() && !is_flag_line(inner) {
        expanded.push(format!("{inner_indent}{inner}{cr}"));
    }
    expanded.push(format!("{}{cr}", flag_line(&inner_indent, enabled)));
    expanded.push(format!("{indent}{tail}{cr}"));
    Some(expanded)
}

fn split_cr(line: &str) -> (&str, &str) {
    match line.strip_suffix('\r') {
        Some(body) => (body, "\r"),
        None => (line, ""),
    }
}

fn rewrite_value(line: &str, enabled: bool) -> String {
    let (body, cr) = split_cr(line);
    let value = flag_value(enabled);
    let rewritten = match body.find('=') {
        Some(eq) => format!("{}{value}", &body[..=eq]),
        None => {
            let indent_len = body.len() - body.trim_start().len();
            flag_line(&body[..indent_len], enabled)
        }
    };
    format!("{rewritten}{cr}")
}

fn indent_for_block(lines: &[String], open: usize) -> String {
    lines
        .get(open + 1)
        .map(|line| split_cr(line).0)
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('}')
        })
        .map(|line| line[..line.len() - line.trim_start().len()].to_string())
        .filter(|indent| !indent.is_empty())
        .unwrap_or_else(|| DEFAULT_INDENT.to_string())
}

/// Returns the patched text, or `None` when `raw` already holds the value.
pub fn patch_text(raw: &str, enabled: bool) -> Option<String> {
    let crlf = raw.contains("\r\n");
    let cr = if crlf { "\r" } else { "" };
    let mut lines: Vec<String> = raw.split('\n').map(str::to_string).collect();
    let location = locate(&lines);

    if let Some(idx) = location.key_line {
        let rewritten = rewrite_value(&lines[idx], enabled);
        if rewritten == lines[idx] {
            return None;
        }
        lines[idx] = rewritten;
        return Some(lines.join("\n"));
    }

    if let Some(open) = location.block_open {
        if location.block_inline {
            let expanded = expand_inline(&lines[open], enabled)?;
            lines.splice(open..=open, expanded);
            return Some(lines.join("\n"));
        }
        let indent = indent_for_block(&lines, open);
        lines.insert(open + 1, format!("{}{cr}", flag_line(&indent, enabled)));
        return Some(lines.join("\n"));
    }

    let newline = if crlf { "\r\n" } else { "\n" };
    let mut out = raw.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push_str(newline);
    }
    out.push_str(&format!("{BLOCK_NAME}{{{newline}"));
    out.push_str(&format!("{DEFAULT_INDENT}{COMPANION_LINE}{newline}"));
    out.push_str(&format!("{}{newline}", flag_line(DEFAULT_INDENT, enabled)));
    out.push_str(&format!("}}{newline}"));
    Some(out)
}

/// Sets `enable_mod` in the host config. A missing file is left alone.
pub fn set_flag(config_path: &Path, enabled: bool) -> Result<()> {
    if !config_path.exists() {
        debug!("{} not found, nothing to patch", config_path.display());
        return Ok(());
    }
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("read {}", config_path.display()))?;
    match patch_text(&raw, enabled) {
        Some(patched) => {
            fs::write(config_path, patched)
                .with_context(|| format!("write {}", config_path.display()))?;
            debug!("{FLAG_KEY} set to {}", flag_value(enabled));
        }
        None => debug!("{FLAG_KEY} already {}", flag_value(enabled)),
    }
    Ok(())
}

pub fn read_flag(config_path: &Path) -> Option<bool> {
    let raw = fs::read_to_string(config_path).ok()?;
    let lines: Vec<String> = raw.split('\n').map(str::to_string).collect();
    let location = locate(&lines);
    match (location.key_line, location.block_open) {
        (Some(idx), _) => value_is_on(split_cr(&lines[idx]).0),
        (None, Some(open)) if location.block_inline => {
            let (_, inner, _) = split_inline(split_cr(&lines[open]).0)?;
            is_flag_line(inner).then(|| value_is_on(inner)).flatten()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = "video{\n  vsync:b=no\n}\nsound{\n  fmod_sound_enable:b=yes\n  speakerMode:t=\"auto\"\n    enable_mod:b=no\n}\n";

    #[test]
    fn rewrites_only_the_value_token() {
        let patched = patch_text(SAMPLE, true).unwrap();
        assert_eq!(
            patched,
            SAMPLE.replace("    enable_mod:b=no", "    enable_mod:b=yes")
        );
        assert!(patch_text(&patched, true).is_none());
        let back = patch_text(&patched, false).unwrap();
        assert_eq!(back, SAMPLE);
    }

    #[test]
    fn inserts_key_after_block_opening() {
        let raw = "sound{\n    speakerMode:t=\"auto\"\n}\n";
        let patched = patch_text(raw, true).unwrap();
        assert_eq!(
            patched,
            "sound{\n    enable_mod:b=yes\n    speakerMode:t=\"auto\"\n}\n"
        );
    }

    #[test]
    fn appends_block_when_missing() {
        let raw = "video{\n  vsync:b=no\n}";
        let patched = patch_text(raw, true).unwrap();
        assert_eq!(
            patched,
            "video{\n  vsync:b=no\n}\nsound{\n  fmod_sound_enable:b=yes\n  enable_mod:b=yes\n}\n"
        );
        assert!(patch_text(&patched, true).is_none());
    }

    #[test]
    fn ignores_same_key_in_other_blocks() {
        let raw = "debug{\n  enable_mod:b=no\n}\nsound{\n  enable_mod:b=no\n}\n";
        let patched = patch_text(raw, true).unwrap();
        assert_eq!(
            patched,
            "debug{\n  enable_mod:b=no\n}\nsound{\n  enable_mod:b=yes\n}\n"
        );
    }

    #[test]
    fn nested_sound_block_is_not_the_target() {
        let raw = "graphics{\n  sound{\n    enable_mod:b=no\n  }\n}\n";
        let patched = patch_text(raw, true).unwrap();
        assert!(patched.starts_with(raw));
        assert!(patched.ends_with("sound{\n  fmod_sound_enable:b=yes\n  enable_mod:b=yes\n}\n"));
    }

    #[test]
    fn keeps_crlf_line_endings() {
        let raw = "sound{\r\n  enable_mod:b=no\r\n}\r\n";
        assert_eq!(
            patch_text(raw, true).unwrap(),
            "sound{\r\n  enable_mod:b=yes\r\n}\r\n"
        );
        let inserted = patch_text("sound{\r\n}\r\n", true).unwrap();
        assert_eq!(inserted, "sound{\r\n  enable_mod:b=yes\r\n}\r\n");
    }

    #[test]
    fn one_line_block_is_expanded_in_place() {
        let patched = patch_text("sound{}\n", true).unwrap();
        assert_eq!(patched, "sound{\n  enable_mod:b=yes\n}\n");
        assert!(patch_text(&patched, true).is_none());

        let raw = "video{\n  vsync:b=no\n}\n  sound{ speakerMode:t=\"auto\" }\r\n";
        assert_eq!(
            patch_text(raw, false).unwrap(),
            "video{\n  vsync:b=no\n}\n  sound{\r\n    speakerMode:t=\"auto\"\r\n    enable_mod:b=no\r\n  }\r\n"
        );
    }

    #[test]
    fn one_line_block_with_flag_reads_and_flips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.blk");
        fs::write(&path, "sound{ enable_mod:b=yes }\n").unwrap();
        assert_eq!(read_flag(&path), Some(true));

        set_flag(&path, true).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "sound{ enable_mod:b=yes }\n");

        set_flag(&path, false).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "sound{\n  enable_mod:b=no\n}\n"
        );
        assert_eq!(read_flag(&path), Some(false));
    }

    #[test]
    fn set_flag_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.blk");
        fs::write(&path, SAMPLE).unwrap();

        set_flag(&path, true).unwrap();
        let once = fs::read(&path).unwrap();
        set_flag(&path, true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), once);
        assert_eq!(read_flag(&path), Some(true));

        set_flag(&path, false).unwrap();
        assert_eq!(read_flag(&path), Some(false));
        assert_eq!(fs::read_to_string(&path).unwrap(), SAMPLE);
    }

    #[test]
    fn missing_config_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.blk");
        set_flag(&path, true).unwrap();
        assert!(!path.exists());
        assert_eq!(read_flag(&path), None);
    }
}
