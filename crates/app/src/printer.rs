//! Incremental terminal output for cumulative stream text.

/// Tracks what has already been written so each cumulative update only
/// prints its new tail.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    shown: String,
}

impl StreamPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to write for the next cumulative `text`. When the stream
    /// rewrote earlier output the whole text is returned on a fresh line.
    pub fn delta(&mut self, text: &str) -> String {
        let out = match text.strip_prefix(self.shown.as_str()) {
            Some(tail) => tail.to_string(),
            None => format!("\n{}", text),
        };
        self.shown = text.to_string();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prints_only_new_tail() {
        let mut printer = StreamPrinter::new();
        assert_eq!(printer.delta("A"), "A");
        assert_eq!(printer.delta("A cat"), " cat");
        assert_eq!(printer.delta("A cat"), "");
    }

    #[test]
    fn test_rewritten_text_starts_over() {
        let mut printer = StreamPrinter::new();
        printer.delta("A dog");
        assert_eq!(printer.delta("A cat"), "\nA cat");
        assert_eq!(printer.delta("A cat sleeps"), " sleeps");
    }
}
