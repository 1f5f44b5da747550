//! Terminal rendering for complete replies.
//!
//! `format_markdown` rewrites a markdown-flavored text block into an
//! ANSI-decorated, boxed rendering. It is a pure function: identical input
//! yields byte-identical output, and constructs it does not recognize pass
//! through untouched.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const ITALIC: &str = "\x1b[3m";
const UNDERLINE: &str = "\x1b[4m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";
const BG_GRAY: &str = "\x1b[100m";

const MAX_FRAME_WIDTH: usize = 80;
const FRAME_TITLE: &str = "Q CLI reply";

static CODE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(\w+)?\n(.*?)\n```").unwrap());
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").unwrap());
static HEADING_3: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^### (.*?)$").unwrap());
static HEADING_2: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^## (.*?)$").unwrap());
static HEADING_1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^# (.*?)$").unwrap());
static BOLD_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.*?)\*\*").unwrap());
static ITALIC_SPAN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.*?)\*").unwrap());
static BULLET_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^- (.*?)$").unwrap());
static ORDERED_ITEM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\d+\. (.*?)$").unwrap());
static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap());

/// Render a markdown-flavored reply as a framed ANSI block.
pub fn format_markdown(content: &str) -> String {
    frame(&decorate(content))
}

fn decorate(content: &str) -> String {
    let text = CODE_BLOCK.replace_all(content, |caps: &Captures| {
        let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let code = &caps[2];
        format!("\n{BG_GRAY}{WHITE} {lang} {RESET}\n{CYAN}{code}{RESET}\n")
    });
    let text = INLINE_CODE.replace_all(&text, format!("{BG_GRAY}{WHITE} ${{1}} {RESET}").as_str());
    let text = HEADING_3.replace_all(&text, format!("{YELLOW}{BOLD}### ${{1}}{RESET}").as_str());
    let text = HEADING_2.replace_all(&text, format!("{GREEN}{BOLD}## ${{1}}{RESET}").as_str());
    let text = HEADING_1.replace_all(&text, format!("{BLUE}{BOLD}# ${{1}}{RESET}").as_str());
    let text = BOLD_SPAN.replace_all(&text, format!("{BOLD}${{1}}{RESET}").as_str());
    let text = ITALIC_SPAN.replace_all(&text, format!("{ITALIC}${{1}}{RESET}").as_str());
    let text = BULLET_ITEM.replace_all(&text, format!("{CYAN}\u{2022} {RESET}${{1}}").as_str());
    let text = ORDERED_ITEM.replace_all(&text, format!("{CYAN}${{0}}{RESET}").as_str());
    let text = LINK.replace_all(
        &text,
        format!("{BLUE}{UNDERLINE}${{1}}{RESET} ({CYAN}${{2}}{RESET})").as_str(),
    );
    text.into_owned()
}

/// Wrap decorated text in a box whose width tracks the longest rendered
/// line in bytes, capped at `MAX_FRAME_WIDTH` columns.
fn frame(decorated: &str) -> String {
    let lines: Vec<&str> = decorated.split('\n').collect();
    let max_width = lines.iter().map(|line| line.len()).max().unwrap_or(50);
    let width = max_width.min(MAX_FRAME_WIDTH);
    let border: String = "\u{2500}".repeat(width);
    let title_pad = " ".repeat(width.saturating_sub(FRAME_TITLE.len() + 2));

    let mut out = format!("\n{BLUE}\u{250c}{border}\u{2510}{RESET}\n");
    out.push_str(&format!(
        "{BLUE}\u{2502}{BOLD} {FRAME_TITLE} {title_pad}\u{2502}{RESET}\n"
    ));
    out.push_str(&format!("{BLUE}\u{251c}{border}\u{2524}{RESET}\n"));

    for line in &lines {
        if line.trim().is_empty() {
            out.push_str(&format!("{BLUE}\u{2502}{RESET}\n"));
        } else {
            out.push_str(&format!("{BLUE}\u{2502}{RESET} {line}\n"));
        }
    }

    out.push_str(&format!("{BLUE}\u{2514}{border}\u{2518}{RESET}\n"));
    out
}
