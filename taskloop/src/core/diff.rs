//! SEARCH/REPLACE blocks used by `replace_in_file`.
//!
//! ```text
//! <<<<<<< SEARCH
//! exact text to find
//! =======
//! replacement text
//! >>>>>>> REPLACE
//! ```

use thiserror::Error;

const SEARCH_MARKER: &str = "<<<<<<< SEARCH";
const DIVIDER: &str = "=======";
const REPLACE_MARKER: &str = ">>>>>>> REPLACE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceBlock {
    pub search: String,
    pub replace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("diff contains no SEARCH/REPLACE blocks")]
    Empty,
    #[error("block {block} is missing its '{marker}' marker")]
    Malformed { block: usize, marker: &'static str },
    #[error("block {block}: SEARCH text is empty")]
    EmptySearch { block: usize },
    #[error("block {block}: SEARCH text not found in file")]
    NotFound { block: usize },
}

enum State {
    Outside,
    Search,
    Replace,
}

/// Parse every SEARCH/REPLACE block in order.
pub fn parse_blocks(diff: &str) -> Result<Vec<ReplaceBlock>, DiffError> {
    let mut blocks = Vec::new();
    let mut state = State::Outside;
    let mut search: Vec<&str> = Vec::new();
    let mut replace: Vec<&str> = Vec::new();

    for line in diff.lines() {
        let marker = line.trim_end();
        match state {
            State::Outside => {
                if marker == SEARCH_MARKER {
                    state = State::Search;
                }
            }
            State::Search => {
                if marker == DIVIDER {
                    state = State::Replace;
                } else if marker == SEARCH_MARKER || marker == REPLACE_MARKER {
                    return Err(DiffError::Malformed {
                        block: blocks.len() + 1,
                        marker: DIVIDER,
                    });
                } else {
                    search.push(line);
                }
            }
            State::Replace => {
                if marker == REPLACE_MARKER {
                    blocks.push(ReplaceBlock {
                        search: search.join("\n"),
                        replace: replace.join("\n"),
                    });
                    search.clear();
                    replace.clear();
                    state = State::Outside;
                } else if marker == SEARCH_MARKER {
                    return Err(DiffError::Malformed {
                        block: blocks.len() + 1,
                        marker: REPLACE_MARKER,
                    });
                } else {
                    replace.push(line);
                }
            }
        }
    }

    match state {
        State::Outside if blocks.is_empty() => Err(DiffError::Empty),
        State::Outside => Ok(blocks),
        State::Search => Err(DiffError::Malformed {
            block: blocks.len() + 1,
            marker: DIVIDER,
        }),
        State::Replace => Err(DiffError::Malformed {
            block: blocks.len() + 1,
            marker: REPLACE_MARKER,
        }),
    }
}

/// Apply blocks in order, replacing the first occurrence of each SEARCH text.
///
/// Either every block applies or the original is left untouched.
pub fn apply_blocks(original: &str, blocks: &[ReplaceBlock]) -> Result<String, DiffError> {
    let mut current = original.to_string();
    for (idx, block) in blocks.iter().enumerate() {
        if block.search.is_empty() {
            return Err(DiffError::EmptySearch { block: idx + 1 });
        }
        if !current.contains(&block.search) {
            return Err(DiffError::NotFound { block: idx + 1 });
        }
        current = current.replacen(&block.search, &block.replace, 1);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_blocks_in_order() {
        let diff = "<<<<<<< SEARCH\nfn a() {}\n=======\nfn a() { 1 }\n>>>>>>> REPLACE\n\n<<<<<<< SEARCH\nlet x = 1;\n=======\nlet x = 2;\n>>>>>>> REPLACE";
        let blocks = parse_blocks(diff).expect("parse");
        assert_eq!(blocks.len(), 2);
        let out = apply_blocks("fn a() {}\nlet x = 1;\nlet x = 1;\n", &blocks).expect("apply");
        assert_eq!(out, "fn a() { 1 }\nlet x = 2;\nlet x = 1;\n");
    }

    #[test]
    fn empty_replace_deletes_text() {
        let blocks = parse_blocks("<<<<<<< SEARCH\nremove me\n=======\n>>>>>>> REPLACE").expect("parse");
        assert_eq!(blocks[0].replace, "");
        assert_eq!(apply_blocks("keep\nremove me\n", &blocks).expect("apply"), "keep\n\n");
    }

    #[test]
    fn missing_search_text_fails_without_partial_edit() {
        let blocks = vec![
            ReplaceBlock {
                search: "a".to_string(),
                replace: "b".to_string(),
            },
            ReplaceBlock {
                search: "zzz".to_string(),
                replace: "y".to_string(),
            },
        ];
        assert_eq!(apply_blocks("a", &blocks), Err(DiffError::NotFound { block: 2 }));
    }

    #[test]
    fn malformed_diffs_are_reported() {
        assert_eq!(parse_blocks("just text"), Err(DiffError::Empty));
        assert_eq!(
            parse_blocks("<<<<<<< SEARCH\nx\n>>>>>>> REPLACE"),
            Err(DiffError::Malformed {
                block: 1,
                marker: DIVIDER
            })
        );
        assert_eq!(
            parse_blocks("<<<<<<< SEARCH\nx\n=======\ny"),
            Err(DiffError::Malformed {
                block: 1,
                marker: REPLACE_MARKER
            })
        );
    }
}
