//! Token-level SQL assembly.
//!
//! Statements are put together from keywords, identifiers and placeholders so
//! spacing is uniform. A WHERE clause taken from the source statement goes in
//! as one opaque fragment and is never re-tokenized.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Comma,
    OpenParen,
    CloseParen,
}

#[derive(Debug, Clone, Default)]
pub struct SqlBuilder {
    tokens: Vec<Token>,
}

impl SqlBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyword(mut self, keyword: &str) -> Self {
        self.tokens.push(Token::Word(keyword.to_ascii_uppercase()));
        self
    }

    pub fn identifier(mut self, name: &str) -> Self {
        self.tokens.push(Token::Word(name.to_string()));
        self
    }

    pub fn placeholder(mut self) -> Self {
        self.tokens.push(Token::Word("?".to_string()));
        self
    }

    /// `a, b, c`
    pub fn identifiers<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for (i, name) in names.iter().enumerate() {
            if i > 0 {
                self.tokens.push(Token::Comma);
            }
            self.tokens.push(Token::Word(name.as_ref().to_string()));
        }
        self
    }

    /// `(a, b, c)`
    pub fn identifier_list<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.tokens.push(Token::OpenParen);
        self = self.identifiers(names);
        self.tokens.push(Token::CloseParen);
        self
    }

    /// `(?, ?, ?)`
    pub fn placeholder_list(mut self, count: usize) -> Self {
        self.tokens.push(Token::OpenParen);
        for i in 0..count {
            if i > 0 {
                self.tokens.push(Token::Comma);
            }
            self.tokens.push(Token::Word("?".to_string()));
        }
        self.tokens.push(Token::CloseParen);
        self
    }

    /// `a = ?, b = ?`
    pub fn assignments<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self.tokens.push(Token::Comma);
            }
            self = self.identifier(column.as_ref()).keyword("=").placeholder();
        }
        self
    }

    /// `a = ? AND b = ?`
    pub fn equality_conditions<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        for (i, column) in columns.iter().enumerate() {
            if i > 0 {
                self = self.keyword("AND");
            }
            self = self.identifier(column.as_ref()).keyword("=").placeholder();
        }
        self
    }

    /// Verbatim text, e.g. a WHERE clause copied from the source statement.
    pub fn fragment(mut self, text: &str) -> Self {
        let text = text.trim();
        if !text.is_empty() {
            self.tokens.push(Token::Word(text.to_string()));
        }
        self
    }

    pub fn build(&self) -> String {
        let mut sql = String::new();
        let mut needs_space = false;

        for token in &self.tokens {
            match token {
                Token::Word(word) => {
                    if needs_space {
                        sql.push(' ');
                    }
                    sql.push_str(word);
                    needs_space = true;
                }
                Token::Comma => {
                    sql.push(',');
                    needs_space = true;
                }
                Token::OpenParen => {
                    if needs_space {
                        sql.push(' ');
                    }
                    sql.push('(');
                    needs_space = false;
                }
                Token::CloseParen => {
                    sql.push(')');
                    needs_space = true;
                }
            }
        }

        sql
    }
}
