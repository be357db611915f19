// Secret Replacer
// Log writer wrapper that masks secret values before output leaves the runner

use crate::engine::LogWriter;
use crate::ir::Secret;

use async_trait::async_trait;

const MASK: &str = "********";

/// Masks every line of every masked secret. Multi-line secrets (keys,
/// certificates) are matched line by line since output arrives per line.
pub struct Replacer {
    inner: Box<dyn LogWriter>,
    needles: Vec<String>,
}

impl Replacer {
    pub fn new<'a>(inner: Box<dyn LogWriter>, secrets: impl IntoIterator<Item = &'a Secret>) -> Self {
        let mut needles: Vec<String> = secrets
            .into_iter()
            .flat_map(|s| s.data.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        // Longest first so a secret containing another is masked whole.
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();
        Self { inner, needles }
    }

    pub fn mask(&self, line: &str) -> String {
        let mut out = line.to_string();
        for needle in &self.needles {
            if out.contains(needle.as_str()) {
                out = out.replace(needle.as_str(), MASK);
            }
        }
        out
    }
}

#[async_trait]
impl LogWriter for Replacer {
    async fn write_line(&mut self, line: &str) {
        if self.needles.is_empty() {
            self.inner.write_line(line).await;
        } else {
            let masked = self.mask(line);
            self.inner.write_line(&masked).await;
        }
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl LogWriter for Capture {
        async fn write_line(&mut self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }

        async fn close(&mut self) {}
    }

    fn secret(data: &str) -> Secret {
        Secret {
            name: "s".to_string(),
            data: data.to_string(),
            mask: true,
        }
    }

    #[tokio::test]
    async fn test_masks_secret_values() {
        let capture = Capture::default();
        let secrets = [secret("hunter2"), secret("-----BEGIN-----\nabc123\n-----END-----")];
        let mut replacer = Replacer::new(Box::new(capture.clone()), secrets.iter());

        replacer.write_line("password is hunter2").await;
        replacer.write_line("key abc123 leaked").await;
        replacer.write_line("nothing here").await;
        replacer.close().await;

        let lines = capture.0.lock().unwrap().clone();
        assert_eq!(
            lines,
            vec!["password is ********", "key ******** leaked", "nothing here"]
        );
    }

    #[test]
    fn test_longest_secret_first() {
        let secrets = [secret("abc"), secret("abcdef")];
        let replacer = Replacer::new(Box::new(Capture::default()), secrets.iter());

        assert_eq!(replacer.mask("xabcdefx"), "x********x");
    }

    #[test]
    fn test_blank_secret_ignored() {
        let secrets = [secret("  \n")];
        let replacer = Replacer::new(Box::new(Capture::default()), secrets.iter());

        assert_eq!(replacer.mask("a b"), "a b");
    }
}
