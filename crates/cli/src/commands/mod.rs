pub mod enqueue;
pub mod export;
pub mod group;
pub mod llm;
pub mod queue;
pub mod view;
pub mod worker;

use std::io::{self, BufRead, Write};

use anyhow::Context;
use chrono::{DateTime, Local, Utc};

/// Ask a yes/no question on the terminal. Anything but `y`/`yes` is a no.
pub(crate) fn confirm(question: &str) -> anyhow::Result<bool> {
    let mut stdout = io::stdout().lock();
    write!(stdout, "{question} [y/N] ")?;
    stdout.flush()?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Timestamps are shown in the operator's local time zone.
pub(crate) fn local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

pub(crate) fn local_opt(at: Option<DateTime<Utc>>) -> String {
    at.map(local).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
        assert!(!is_yes("yep"));
    }
}
