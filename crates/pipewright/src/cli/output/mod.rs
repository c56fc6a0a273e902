//! Output formatting utilities

use console::{style, Style};

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Print an info message
pub fn info(message: &str) {
    println!("{} {}", style("→").blue(), message);
}

/// Create a styled header
pub fn header(text: &str) -> String {
    style(text).bold().to_string()
}

/// Create a styled key-value line
pub fn key_value(key: &str, value: &str) -> String {
    format!("  {}: {}", style(key).dim(), value)
}

/// Style for paths
pub fn path_style() -> Style {
    Style::new().cyan()
}

/// Style for cache keys
pub fn key_style() -> Style {
    Style::new().yellow()
}

/// First 12 characters of a fingerprint, enough to tell entries apart
pub fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

/// `valid` in green or `expired` in red
pub fn validity(expired: bool) -> String {
    if expired {
        style("expired").red().to_string()
    } else {
        style("valid").green().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_key() {
        assert_eq!(short_key("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_key("abc"), "abc");
    }
}
