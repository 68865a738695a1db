//! Operator prompting on standard input.

use std::io;
use std::io::BufRead;
use std::io::Write;

/// Shows `text` and reads one line from standard input. This function returns
/// `None` on end of input.
pub fn prompt(text: &str) -> Option<String> {
    print!("{text}");
    let _ = io::stdout().flush();
    let input = io::stdin().lock().lines().next()?.unwrap_or(String::new());
    Some(input)
}
