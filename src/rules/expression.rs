//! Boolean expressions over clause labels
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or   := and ("OR" and)*
//! and  := not ("AND" not)*
//! not  := "NOT" not | atom
//! atom := LABEL | "(" or ")"
//! ```
//!
//! Keywords are case-insensitive. Labels are runs of letters, digits, `_` and `-`.

use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Label(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unbalanced parentheses")]
    Unbalanced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Label(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Label(label) => label.clone(),
            Token::And => "AND".to_string(),
            Token::Or => "OR".to_string(),
            Token::Not => "NOT".to_string(),
            Token::Open => "(".to_string(),
            Token::Close => ")".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' {
            chars.next();
            tokens.push(Token::Open);
        } else if c == ')' {
            chars.next();
            tokens.push(Token::Close);
        } else if c.is_alphanumeric() || c == '_' || c == '-' {
            let mut word = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_alphanumeric() || c == '_' || c == '-' {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            let token = match word.to_ascii_uppercase().as_str() {
                "AND" => Token::And,
                "OR" => Token::Or,
                "NOT" => Token::Not,
                _ => Token::Label(word),
            };
            tokens.push(token);
        } else {
            return Err(ExpressionError::UnexpectedChar(c, offset));
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Label(label)) => Ok(Expr::Label(label)),
            Some(Token::Open) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(ExpressionError::Unbalanced),
                }
            }
            Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Empty);
        }

        let mut parser = Parser { tokens, position: 0 };
        let expr = parser.or()?;
        match parser.next() {
            None => Ok(expr),
            Some(Token::Close) => Err(ExpressionError::Unbalanced),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.describe())),
        }
    }

    /// Evaluate with `resolve` deciding each label
    pub fn evaluate(&self, resolve: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Expr::Label(label) => resolve(label),
            Expr::Not(inner) => !inner.evaluate(resolve),
            Expr::And(left, right) => left.evaluate(resolve) && right.evaluate(resolve),
            Expr::Or(left, right) => left.evaluate(resolve) || right.evaluate(resolve),
        }
    }

    /// Every label the expression references
    pub fn labels(&self) -> BTreeSet<&str> {
        let mut labels = BTreeSet::new();
        self.collect_labels(&mut labels);
        labels
    }

    fn collect_labels<'a>(&'a self, labels: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Label(label) => {
                labels.insert(label.as_str());
            }
            Expr::Not(inner) => inner.collect_labels(labels),
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.collect_labels(labels);
                right.collect_labels(labels);
            }
        }
    }
}
