use cube_core::{CubeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Select,
    Distinct,
    From,
    Where,
    Group,
    Order,
    By,
    Having,
    Limit,
    Offset,
    Join,
    Inner,
    Left,
    Right,
    Full,
    Cross,
    On,
    Union,
    With,
    As,
    And,
    Or,
    Not,
    In,
    Between,
    Is,
    Null,
    Asc,
    Desc,
    True,
    False,
    // Write and DDL verbs, recognised only so they can be refused
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Truncate,
    Merge,
    Grant,
    Revoke,
    Copy,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // Delimiters
    LeftParen,
    RightParen,
    Comma,
    Dot,
    Semicolon,

    // Literals
    Number(String),
    String(String),
    /// Unquoted identifiers are folded to lower case, quoted ones are kept verbatim
    Identifier(String),

    // Special
    Eof,
}

impl Token {
    /// Whether this token starts a statement that modifies data or schema
    pub fn is_write_verb(&self) -> bool {
        matches!(
            self,
            Token::Insert
                | Token::Update
                | Token::Delete
                | Token::Create
                | Token::Drop
                | Token::Alter
                | Token::Truncate
                | Token::Merge
                | Token::Grant
                | Token::Revoke
                | Token::Copy
        )
    }
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word.to_ascii_uppercase().as_str() {
        "SELECT" => Token::Select,
        "DISTINCT" => Token::Distinct,
        "FROM" => Token::From,
        "WHERE" => Token::Where,
        "GROUP" => Token::Group,
        "ORDER" => Token::Order,
        "BY" => Token::By,
        "HAVING" => Token::Having,
        "LIMIT" => Token::Limit,
        "OFFSET" => Token::Offset,
        "JOIN" => Token::Join,
        "INNER" => Token::Inner,
        "LEFT" => Token::Left,
        "RIGHT" => Token::Right,
        "FULL" => Token::Full,
        "CROSS" => Token::Cross,
        "ON" => Token::On,
        "UNION" => Token::Union,
        "WITH" => Token::With,
        "AS" => Token::As,
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "IN" => Token::In,
        "BETWEEN" => Token::Between,
        "IS" => Token::Is,
        "NULL" => Token::Null,
        "ASC" => Token::Asc,
        "DESC" => Token::Desc,
        "TRUE" => Token::True,
        "FALSE" => Token::False,
        "INSERT" => Token::Insert,
        "UPDATE" => Token::Update,
        "DELETE" => Token::Delete,
        "CREATE" => Token::Create,
        "DROP" => Token::Drop,
        "ALTER" => Token::Alter,
        "TRUNCATE" => Token::Truncate,
        "MERGE" => Token::Merge,
        "GRANT" => Token::Grant,
        "REVOKE" => Token::Revoke,
        "COPY" => Token::Copy,
        _ => return None,
    };
    Some(token)
}

/// Whether `word` would lex as a keyword rather than an identifier
pub fn is_keyword(word: &str) -> bool {
    keyword(word).is_some()
}

pub struct Lexer {
    input: Vec<char>,
    position: usize,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            position: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        while self.position < self.input.len() {
            self.skip_whitespace();

            if self.position >= self.input.len() {
                break;
            }

            tokens.push(self.next_token()?);
        }

        tokens.push(Token::Eof);
        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Token> {
        let ch = self.current_char();

        let token = match ch {
            '+' => {
                self.advance();
                Token::Plus
            }
            '-' => {
                self.advance();
                if self.current_char() == '-' {
                    return Err(parse_error("SQL comments are not allowed"));
                }
                Token::Minus
            }
            '*' => {
                self.advance();
                Token::Star
            }
            '/' => {
                self.advance();
                if self.current_char() == '*' {
                    return Err(parse_error("SQL comments are not allowed"));
                }
                Token::Slash
            }
            '%' => {
                self.advance();
                Token::Percent
            }
            '=' => {
                self.advance();
                Token::Equal
            }
            '<' => {
                self.advance();
                if self.current_char() == '=' {
                    self.advance();
                    Token::LessEqual
                } else if self.current_char() == '>' {
                    self.advance();
                    Token::NotEqual
                } else {
                    Token::Less
                }
            }
            '>' => {
                self.advance();
                if self.current_char() == '=' {
                    self.advance();
                    Token::GreaterEqual
                } else {
                    Token::Greater
                }
            }
            '!' => {
                self.advance();
                if self.current_char() == '=' {
                    self.advance();
                    Token::NotEqual
                } else {
                    return Err(parse_error("Unexpected character '!'"));
                }
            }
            '(' => {
                self.advance();
                Token::LeftParen
            }
            ')' => {
                self.advance();
                Token::RightParen
            }
            ',' => {
                self.advance();
                Token::Comma
            }
            '.' => {
                self.advance();
                Token::Dot
            }
            ';' => {
                self.advance();
                Token::Semicolon
            }
            '\'' => Token::String(self.read_quoted('\'')?),
            '"' => {
                let ident = self.read_quoted('"')?;
                if ident.is_empty() {
                    return Err(parse_error("Empty quoted identifier"));
                }
                Token::Identifier(ident)
            }
            _ if ch.is_ascii_digit() => self.read_number(),
            _ if ch.is_alphabetic() || ch == '_' => self.read_identifier(),
            _ => {
                return Err(parse_error(format!("Unexpected character: '{}'", ch)));
            }
        };

        Ok(token)
    }

    /// Read a quoted run; a doubled quote character stands for itself
    fn read_quoted(&mut self, quote: char) -> Result<String> {
        self.advance();

        let mut value = String::new();
        loop {
            if self.position >= self.input.len() {
                return Err(parse_error("Unterminated quoted text"));
            }
            let ch = self.current_char();
            self.advance();
            if ch == quote {
                if self.current_char() == quote && self.position < self.input.len() {
                    value.push(quote);
                    self.advance();
                    continue;
                }
                break;
            }
            value.push(ch);
        }

        Ok(value)
    }

    fn read_number(&mut self) -> Token {
        let mut number = String::new();

        while self.position < self.input.len()
            && (self.current_char().is_ascii_digit() || self.current_char() == '.')
        {
            number.push(self.current_char());
            self.advance();
        }

        Token::Number(number)
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();

        while self.position < self.input.len()
            && (self.current_char().is_alphanumeric() || self.current_char() == '_')
        {
            ident.push(self.current_char());
            self.advance();
        }

        keyword(&ident).unwrap_or_else(|| Token::Identifier(ident.to_lowercase()))
    }

    fn current_char(&self) -> char {
        if self.position < self.input.len() {
            self.input[self.position]
        } else {
            '\0'
        }
    }

    fn advance(&mut self) {
        self.position += 1;
    }

    fn skip_whitespace(&mut self) {
        while self.position < self.input.len() && self.current_char().is_whitespace() {
            self.advance();
        }
    }
}

fn parse_error(msg: impl Into<String>) -> CubeError {
    CubeError::RejectedQuery(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(sql: &str) -> Vec<Token> {
        Lexer::new(sql).tokenize().unwrap()
    }

    #[test]
    fn test_identifiers_fold_to_lower_case() {
        let tokens = lex("SELECT P1, \"MixedCase\" FROM Facts");
        assert_eq!(
            tokens,
            vec![
                Token::Select,
                Token::Identifier("p1".into()),
                Token::Comma,
                Token::Identifier("MixedCase".into()),
                Token::From,
                Token::Identifier("facts".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_aggregate_names_are_identifiers() {
        let tokens = lex("sum(count)");
        assert_eq!(tokens[0], Token::Identifier("sum".into()));
        assert_eq!(tokens[2], Token::Identifier("count".into()));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = lex("'it''s'");
        assert_eq!(tokens[0], Token::String("it's".into()));
    }

    #[test]
    fn test_comments_rejected() {
        assert!(Lexer::new("SELECT 1 -- hidden").tokenize().is_err());
        assert!(Lexer::new("SELECT /* hidden */ 1").tokenize().is_err());
    }

    #[test]
    fn test_write_verbs() {
        let tokens = lex("drop table facts; delete from facts");
        assert!(tokens[0].is_write_verb());
        assert!(tokens.iter().any(|t| *t == Token::Delete));
        assert!(!Token::Select.is_write_verb());
    }

    #[test]
    fn test_operators() {
        let tokens = lex("a <> 1 AND b != 2 AND c >= 3");
        assert_eq!(tokens.iter().filter(|t| **t == Token::NotEqual).count(), 2);
        assert!(tokens.contains(&Token::GreaterEqual));
    }
}
