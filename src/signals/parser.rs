use regex::Regex;
use std::sync::LazyLock;

static NEXT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<next>\s*(.*?)\s*</next>").unwrap());

/// Everything the controller reads from one worker output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSignals {
    pub sentinel_found: bool,
    pub next_steps: Vec<String>,
}

impl WorkerSignals {
    pub fn parse(text: &str, sentinel: &str) -> Self {
        Self {
            sentinel_found: sentinel_present(text, sentinel),
            next_steps: extract_next_steps(text),
        }
    }
}

/// True when some line of `text`, trimmed, is exactly `sentinel` or
/// `<promise>sentinel</promise>`. Substrings never count, so a worker that
/// merely mentions the sentinel mid-sentence has not completed.
pub fn sentinel_present(text: &str, sentinel: &str) -> bool {
    let sentinel = sentinel.trim();
    if sentinel.is_empty() {
        return false;
    }
    text.lines().map(str::trim).any(|line| {
        line == sentinel
            || line
                .strip_prefix("<promise>")
                .and_then(|rest| rest.strip_suffix("</promise>"))
                .is_some_and(|inner| inner.trim() == sentinel)
    })
}

/// Lines inside every `<next>` block, with list bullets stripped.
pub fn extract_next_steps(text: &str) -> Vec<String> {
    let mut steps = Vec::new();
    for cap in NEXT_REGEX.captures_iter(text) {
        let Some(body) = cap.get(1) else { continue };
        for line in body.as_str().lines() {
            let step = line
                .trim()
                .trim_start_matches(['-', '*'])
                .trim_start();
            let step = strip_numbering(step);
            if !step.is_empty() {
                steps.push(step.to_string());
            }
        }
    }
    steps
}

/// `1. foo` / `2) foo` -> `foo`
fn strip_numbering(line: &str) -> &str {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return line;
    }
    match line[digits..].strip_prefix(['.', ')']) {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_on_own_line() {
        assert!(sentinel_present("fixed lint\nTASK COMPLETE\n", "TASK COMPLETE"));
        assert!(sentinel_present("  TASK COMPLETE  ", "TASK COMPLETE"));
    }

    #[test]
    fn test_sentinel_in_promise_tag() {
        assert!(sentinel_present("done\n<promise>LINT_OK</promise>", "LINT_OK"));
        assert!(sentinel_present("<promise> LINT_OK </promise>", "LINT_OK"));
    }

    #[test]
    fn test_sentinel_substring_does_not_match() {
        assert!(!sentinel_present("I will print TASK COMPLETE when done", "TASK COMPLETE"));
        assert!(!sentinel_present("TASK COMPLETED", "TASK COMPLETE"));
        assert!(!sentinel_present("<promise>LINT_OK_NOT</promise>", "LINT_OK"));
    }

    #[test]
    fn test_empty_sentinel_never_matches() {
        assert!(!sentinel_present("\n\n", ""));
    }

    #[test]
    fn test_extract_next_steps_strips_bullets() {
        let text = "work done\n<next>\n- run cargo fmt\n* fix clippy warning\n2. update docs\n</next>";
        assert_eq!(
            extract_next_steps(text),
            vec!["run cargo fmt", "fix clippy warning", "update docs"]
        );
    }

    #[test]
    fn test_extract_next_steps_multiple_blocks() {
        let text = "<next>first</next> noise <next>second</next>";
        assert_eq!(extract_next_steps(text), vec!["first", "second"]);
    }

    #[test]
    fn test_no_next_block_yields_empty() {
        assert!(extract_next_steps("nothing planned").is_empty());
    }

    #[test]
    fn test_worker_signals_parse() {
        let s = WorkerSignals::parse("<next>deploy</next>\nDONE", "DONE");
        assert!(s.sentinel_found);
        assert_eq!(s.next_steps, vec!["deploy"]);
    }
}
