use crate::{SyncError, SyncResult};

/// A compiled content expression such as `"title block+"` or `"(paragraph | heading)*"`
///
/// Supported syntax: a sequence of terms, where a term is a node/group name
/// or a parenthesized `|` alternative, optionally followed by `?`, `*` or `+`.
/// Group names are expanded to node type names when the schema compiles.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentExpr {
    source: String,
    terms: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq)]
struct Term {
    names: Vec<String>,
    min: usize,
    max: Option<usize>,
}

impl Term {
    fn accepts(&self, node_type: &str) -> bool {
        self.names.iter().any(|name| name == node_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Open,
    Close,
    Pipe,
    Quant(char),
}

fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in source.chars() {
        let special = match c {
            '(' => Some(Token::Open),
            ')' => Some(Token::Close),
            '|' => Some(Token::Pipe),
            '*' | '+' | '?' => Some(Token::Quant(c)),
            _ => None,
        };
        if special.is_some() || c.is_whitespace() {
            if !word.is_empty() {
                tokens.push(Token::Word(std::mem::take(&mut word)));
            }
            if let Some(token) = special {
                tokens.push(token);
            }
        } else {
            word.push(c);
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

impl ContentExpr {
    /// Parse an expression, expanding names through `expand` (group → node types)
    pub(crate) fn parse<F>(source: &str, expand: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<Vec<String>>,
    {
        let tokens = tokenize(source);
        let mut terms = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let mut names = Vec::new();
            match &tokens[i] {
                Token::Word(word) => {
                    names.extend(resolve_name(word, &expand, source)?);
                    i += 1;
                }
                Token::Open => {
                    i += 1;
                    loop {
                        match tokens.get(i) {
                            Some(Token::Word(word)) => {
                                names.extend(resolve_name(word, &expand, source)?)
                            }
                            Some(Token::Pipe) => {}
                            Some(Token::Close) => break,
                            _ => {
                                return Err(SyncError::schema(format!(
                                    "Unclosed group in content expression '{}'",
                                    source
                                )))
                            }
                        }
                        i += 1;
                    }
                    i += 1;
                }
                other => {
                    return Err(SyncError::schema(format!(
                        "Unexpected token {:?} in content expression '{}'",
                        other, source
                    )))
                }
            }
            let (min, max) = match tokens.get(i) {
                Some(Token::Quant('*')) => (0, None),
                Some(Token::Quant('+')) => (1, None),
                Some(Token::Quant('?')) => (0, Some(1)),
                _ => (1, Some(1)),
            };
            if matches!(tokens.get(i), Some(Token::Quant(_))) {
                i += 1;
            }
            terms.push(Term { names, min, max });
        }
        Ok(ContentExpr {
            source: source.to_string(),
            terms,
        })
    }

    /// The expression as written in the schema
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression allows no content at all (the node is a leaf)
    pub fn is_leaf(&self) -> bool {
        self.terms.is_empty()
    }

    /// Whether any child of the given type may appear
    pub fn allows(&self, node_type: &str) -> bool {
        self.terms.iter().any(|term| term.accepts(node_type))
    }

    /// Whether some node type is allowed by both expressions
    pub(crate) fn shares_type_with(&self, other: &ContentExpr) -> bool {
        self.terms
            .iter()
            .flat_map(|term| term.names.iter())
            .any(|name| other.allows(name))
    }

    /// One type name per required occurrence, picking the first alternative
    pub(crate) fn required_names(&self) -> Vec<String> {
        self.terms
            .iter()
            .flat_map(|term| std::iter::repeat(term.names[0].clone()).take(term.min))
            .collect()
    }

    /// Check a full sequence of child types against the expression
    pub fn matches<S: AsRef<str>>(&self, children: &[S]) -> bool {
        match_from(&self.terms, 0, children, 0)
    }
}

fn resolve_name<F>(word: &str, expand: &F, source: &str) -> SyncResult<Vec<String>>
where
    F: Fn(&str) -> Option<Vec<String>>,
{
    match expand(word) {
        Some(names) if !names.is_empty() => Ok(names),
        _ => Err(SyncError::schema(format!(
            "Unknown node type or group '{}' in content expression '{}'",
            word, source
        ))),
    }
}

fn match_from<S: AsRef<str>>(terms: &[Term], t: usize, children: &[S], c: usize) -> bool {
    let Some(term) = terms.get(t) else {
        return c == children.len();
    };
    let limit = term.max.unwrap_or(usize::MAX);
    let mut end = c;
    while end < children.len() && end - c < limit && term.accepts(children[end].as_ref()) {
        end += 1;
    }
    // Greedy first, backtracking towards the minimum
    for stop in (c..=end).rev() {
        if stop - c < term.min {
            break;
        }
        if match_from(terms, t + 1, children, stop) {
            return true;
        }
    }
    false
}
