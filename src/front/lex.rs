//! The lexer.

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum TokenKind {
    #[display("id")]
    Id,
    #[display("int literal")]
    IntNum,
    #[display("float literal")]
    FloatNum,
    #[display("int")]
    Int,
    #[display("float")]
    Float,
    #[display("void")]
    Void,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("while")]
    While,
    #[display("break")]
    Break,
    #[display("continue")]
    Continue,
    #[display("return")]
    Return,
    #[display("=")]
    Assign,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("%")]
    Percent,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
    #[display("==")]
    EqEq,
    #[display("!=")]
    Ne,
    #[display("&&")]
    AndAnd,
    #[display("||")]
    OrOr,
    #[display("!")]
    Not,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    #[display(",")]
    Comma,
    #[display(";")]
    Semi,
}

pub struct LexError(usize, char);

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lexer error: unexpected character {:?} at {}",
            self.1, self.0
        )
    }
}

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lexer error: unexpected character {:?} at {}",
            self.1, self.0
        )
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;

        let matcher = |re, kind| (Regex::new(re).unwrap(), kind);
        Lexer {
            input,
            pos: 0,
            whitespace: Regex::new(
                r"\A(?:[ \t\f\r\n\v]|//.*|/\*[^*]*\*+(?:[^/*][^*]*\*+)*/)*",
            )
            .unwrap(),
            // Tried in order, so keywords go before identifiers and
            // two-character operators before their one-character prefixes.
            matchers: vec![
                matcher(r"\Aint\b", Int),
                matcher(r"\Afloat\b", Float),
                matcher(r"\Avoid\b", Void),
                matcher(r"\Aif\b", If),
                matcher(r"\Aelse\b", Else),
                matcher(r"\Awhile\b", While),
                matcher(r"\Abreak\b", Break),
                matcher(r"\Acontinue\b", Continue),
                matcher(r"\Areturn\b", Return),
                matcher(r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
                matcher(r"\A0[xX][0-9a-fA-F]+", IntNum),
                matcher(r"\A(?:\d+\.\d*|\.\d+)(?:[eE][+-]?\d+)?", FloatNum),
                matcher(r"\A\d+[eE][+-]?\d+", FloatNum),
                matcher(r"\A\d+", IntNum),
                matcher(r"\A<=", Le),
                matcher(r"\A>=", Ge),
                matcher(r"\A==", EqEq),
                matcher(r"\A!=", Ne),
                matcher(r"\A&&", AndAnd),
                matcher(r"\A\|\|", OrOr),
                matcher(r"\A<", Lt),
                matcher(r"\A>", Gt),
                matcher(r"\A=", Assign),
                matcher(r"\A!", Not),
                matcher(r"\A\+", Plus),
                matcher(r"\A-", Minus),
                matcher(r"\A\*", Star),
                matcher(r"\A/", Slash),
                matcher(r"\A%", Percent),
                matcher(r"\A\(", LParen),
                matcher(r"\A\)", RParen),
                matcher(r"\A\{", LBrace),
                matcher(r"\A\}", RBrace),
                matcher(r"\A\[", LBracket),
                matcher(r"\A\]", RBracket),
                matcher(r"\A,", Comma),
                matcher(r"\A;", Semi),
            ],
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.pos += m.end()
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let rest = &self.input[self.pos..];
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                let text = &rest[..m.end()];
                self.pos += m.end();
                return Ok(Some(Token { kind: *kind, text }));
            }
        }
        Err(LexError(self.pos, rest.chars().next().unwrap()))
    }
}

/// Lex a whole input.
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next()? {
        tokens.push(token);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::TokenKind::*;
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("int intx while whiler"),
            vec![Int, Id, While, Id],
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(kinds("42 0x2a 1.5 .5 2. 1e3"), vec![
            IntNum, IntNum, FloatNum, FloatNum, FloatNum, FloatNum
        ]);
    }

    #[test]
    fn operators_longest_first() {
        assert_eq!(kinds("<= < == = && !"), vec![Le, Lt, EqEq, Assign, AndAnd, Not]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(kinds("a // line\n b /* block\n still */ c"), vec![Id, Id, Id]);
    }

    #[test]
    fn bad_character() {
        let mut lexer = Lexer::new("a $ b");
        assert!(lexer.next().unwrap().is_some());
        assert!(lexer.next().is_err());
    }
}
