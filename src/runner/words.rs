//! Word splitting for cmd tasks
//!
//! Splits an already expanded command line the way a POSIX shell would split a
//! simple command: whitespace separates words, single quotes are literal,
//! double quotes allow backslash escapes, an unquoted `#` starting a word
//! begins a comment. Unquoted glob characters are remembered so that only
//! those words are expanded against the filesystem.

use glob::{MatchOptions, Pattern};
use std::path::Path;
use tracing::debug;

/// A single word of a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    /// The word with quotes and escapes removed
    pub text: String,
    /// Glob pattern when the word has unquoted glob characters
    pub pattern: Option<String>,
}

#[derive(Default)]
struct WordBuilder {
    text: String,
    pattern: String,
    has_glob: bool,
    started: bool,
}

impl WordBuilder {
    fn push_quoted(&mut self, c: char) {
        self.started = true;
        self.text.push(c);
        self.pattern.push_str(&Pattern::escape(&c.to_string()));
    }

    fn push_unquoted(&mut self, c: char) {
        self.started = true;
        self.text.push(c);
        if matches!(c, '*' | '?' | '[') {
            self.has_glob = true;
            self.pattern.push(c);
        } else {
            self.pattern.push_str(&Pattern::escape(&c.to_string()));
        }
    }

    fn finish(&mut self, words: &mut Vec<Word>) {
        if self.started {
            let builder = std::mem::take(self);
            words.push(Word {
                text: builder.text,
                pattern: builder.has_glob.then_some(builder.pattern),
            });
        }
    }
}

/// Split a command line into words
pub fn split_words(line: &str) -> Result<Vec<Word>, String> {
    let mut words = Vec::new();
    let mut word = WordBuilder::default();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => word.finish(&mut words),
            '#' if !word.started => {
                // comment runs to end of line
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '\'' => {
                word.started = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(q) => word.push_quoted(q),
                        None => return Err(format!("unterminated single quote in: {}", line)),
                    }
                }
            }
            '"' => {
                word.started = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\' | '$' | '`')) => word.push_quoted(e),
                            Some('\n') => {}
                            Some(other) => {
                                word.push_quoted('\\');
                                word.push_quoted(other);
                            }
                            None => {
                                return Err(format!("unterminated double quote in: {}", line))
                            }
                        },
                        Some(q) => word.push_quoted(q),
                        None => return Err(format!("unterminated double quote in: {}", line)),
                    }
                }
            }
            '\\' => match chars.next() {
                // line continuation
                Some('\n') => {}
                Some(escaped) => word.push_quoted(escaped),
                None => word.push_quoted('\\'),
            },
            other => word.push_unquoted(other),
        }
    }
    word.finish(&mut words);

    Ok(words)
}

/// Resolve glob words against `cwd`, keeping words that match nothing as-is
pub fn expand_globs(words: Vec<Word>, cwd: &Path) -> Vec<String> {
    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::default()
    };

    let mut out = Vec::with_capacity(words.len());
    for word in words {
        let Some(pattern) = word.pattern else {
            out.push(word.text);
            continue;
        };

        let relative = !Path::new(&pattern).is_absolute();
        let full_pattern = if relative {
            format!("{}/{}", Pattern::escape(&cwd.to_string_lossy()), pattern)
        } else {
            pattern.clone()
        };

        let mut matches: Vec<String> = match glob::glob_with(&full_pattern, options) {
            Ok(paths) => paths
                .filter_map(|entry| entry.ok())
                .map(|path| {
                    if relative {
                        path.strip_prefix(cwd)
                            .map(|p| p.to_string_lossy().into_owned())
                            .unwrap_or_else(|_| path.to_string_lossy().into_owned())
                    } else {
                        path.to_string_lossy().into_owned()
                    }
                })
                .collect(),
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "invalid glob pattern, keeping word");
                Vec::new()
            }
        };

        if matches.is_empty() {
            out.push(word.text);
        } else {
            matches.sort();
            out.append(&mut matches);
        }
    }
    out
}

/// Convenience for splitting a string into plain words, ignoring glob markers
pub fn split_plain(line: &str) -> Result<Vec<String>, String> {
    Ok(split_words(line)?.into_iter().map(|w| w.text).collect())
}

/// Quote a word for display so it reads back as the same word
pub fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Join words for display
pub fn join(words: &[String]) -> String {
    words.iter().map(|w| quote(w)).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn texts(line: &str) -> Vec<String> {
        split_plain(line).unwrap()
    }

    #[test]
    fn test_split_whitespace() {
        assert_eq!(texts("echo  a\tb\n c"), vec!["echo", "a", "b", "c"]);
        assert_eq!(texts("A \n  hey\n\n B"), vec!["A", "hey", "B"]);
        assert!(texts("   ").is_empty());
    }

    #[test]
    fn test_split_quotes() {
        assert_eq!(
            texts(r#"echo 'a  b' "c \"d\" \x" e'f'g"#),
            vec!["echo", "a  b", r#"c "d" \x"#, "efg"]
        );
        assert_eq!(texts("echo ''"), vec!["echo", ""]);
    }

    #[test]
    fn test_split_backslashes() {
        assert_eq!(texts(r"echo \\/root"), vec!["echo", r"\/root"]);
        assert_eq!(texts("echo a\\\nb"), vec!["echo", "ab"]);
        assert_eq!(texts(r"echo a\ b"), vec!["echo", "a b"]);
    }

    #[test]
    fn test_split_comments() {
        assert_eq!(
            texts("echo one # trailing\necho#two"),
            vec!["echo", "one", "echo#two"]
        );
    }

    #[test]
    fn test_unterminated_quote_is_error() {
        assert!(split_words("echo 'oops").is_err());
        assert!(split_words("echo \"oops").is_err());
    }

    #[test]
    fn test_glob_markers() {
        let words = split_words(r#"ls *.txt "*.md" \*.rs"#).unwrap();
        assert_eq!(words[1].pattern.as_deref(), Some("*.txt"));
        assert_eq!(words[2].pattern, None);
        assert_eq!(words[3].pattern, None);
        assert_eq!(
            words[0],
            Word {
                text: "ls".to_string(),
                pattern: None
            }
        );
    }

    #[test]
    fn test_expand_globs() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();
        fs::write(dir.path().join("a.txt"), "").unwrap();
        fs::write(dir.path().join(".hidden.txt"), "").unwrap();

        let words = split_words("cat *.txt *.none '*.txt'").unwrap();
        let expanded = expand_globs(words, dir.path());
        assert_eq!(expanded, vec!["cat", "a.txt", "b.txt", "*.none", "*.txt"]);
    }

    #[test]
    fn test_quote_for_display() {
        assert_eq!(quote("simple"), "simple");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(join(&["echo".into(), "a b".into()]), "echo 'a b'");
    }
}
